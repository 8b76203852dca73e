// Similarity index: one record per incident class, matched by Hamming distance.
//
// Records are scanned in insertion order and the first one within the threshold
// wins, even when a later record is closer. The index does no locking of its own;
// mutation needs `&mut self`, so callers serialize access.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentRecord {
    representative: Fingerprint,
    last_alerted_at: DateTime<Utc>,
}

impl IncidentRecord {
    fn new(representative: Fingerprint, at: DateTime<Utc>) -> Self {
        Self {
            representative,
            last_alerted_at: at,
        }
    }

    /// Fingerprint of the message that opened this incident class. Never changes.
    pub fn representative(&self) -> Fingerprint {
        self.representative
    }

    pub fn last_alerted_at(&self) -> DateTime<Utc> {
        self.last_alerted_at
    }

    /// Record a re-alert at `at`, returning the previous alert time.
    pub fn touch(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        std::mem::replace(&mut self.last_alerted_at, at)
    }
}

#[derive(Debug, Default)]
pub struct SimilarityIndex {
    records: Vec<IncidentRecord>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// First record, in insertion order, within `threshold` bits of `fingerprint`.
    pub fn find(&self, fingerprint: Fingerprint, threshold: u32) -> Option<&IncidentRecord> {
        self.records
            .iter()
            .find(|record| record.representative.distance(&fingerprint) <= threshold)
    }

    pub fn find_mut(
        &mut self,
        fingerprint: Fingerprint,
        threshold: u32,
    ) -> Option<&mut IncidentRecord> {
        self.records
            .iter_mut()
            .find(|record| record.representative.distance(&fingerprint) <= threshold)
    }

    /// Open a new incident class with `fingerprint` as its representative.
    pub fn insert(&mut self, fingerprint: Fingerprint, at: DateTime<Utc>) -> &IncidentRecord {
        debug_assert!(
            self.records.iter().all(|r| r.representative != fingerprint),
            "incident {} already indexed",
            fingerprint
        );
        self.records.push(IncidentRecord::new(fingerprint, at));
        &self.records[self.records.len() - 1]
    }

    /// Drop records whose last alert is more than `horizon` before `now`.
    /// Survivors keep their relative order.
    pub fn evict_idle(&mut self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|record| now - record.last_alerted_at <= horizon);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncidentRecord> {
        self.records.iter()
    }
}
