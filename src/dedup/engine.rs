// Similarity-Based Alert Decision Engine
// Decides per message whether to alert (new or stale incident) or suppress.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::fingerprint::{fingerprint, Fingerprint};
use super::index::SimilarityIndex;
use crate::admission::{AdmissionClosed, AdmissionSender};
use crate::config::DedupConfig;
use crate::envelope::{AlertEvent, AlertKind, LogEnvelope};

/// Longest window or horizon, in seconds, a `chrono::Duration` can hold.
pub const MAX_WINDOW_SECS: u64 = i64::MAX as u64 / 1000;

/// Immutable decision parameters, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub similarity_threshold: u32,
    pub realert_window_secs: u64,
    pub eviction_horizon_secs: Option<u64>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 3,
            realert_window_secs: 3600,
            eviction_horizon_secs: None,
        }
    }
}

impl From<&DedupConfig> for DecisionConfig {
    fn from(config: &DedupConfig) -> Self {
        Self {
            similarity_threshold: u32::from(config.similarity_threshold),
            realert_window_secs: config.realert_window_secs,
            eviction_horizon_secs: config.eviction_horizon_secs,
        }
    }
}

impl DecisionConfig {
    fn realert_window(&self) -> Duration {
        clamped_seconds(self.realert_window_secs)
    }

    fn eviction_horizon(&self) -> Option<Duration> {
        self.eviction_horizon_secs.map(clamped_seconds)
    }
}

// Out-of-range values saturate to the longest representable span.
fn clamped_seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs.min(MAX_WINDOW_SECS)).unwrap_or(i64::MAX / 1000);
    Duration::seconds(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No known incident within the threshold; a new record was opened.
    NewIncident { incident: Fingerprint },
    /// Matched an incident whose last alert is older than the re-alert window.
    RecurringStale {
        incident: Fingerprint,
        previous_alert: DateTime<Utc>,
    },
    /// Matched an incident alerted within the window.
    Suppressed { incident: Fingerprint },
}

impl Decision {
    pub fn should_alert(&self) -> bool {
        !matches!(self, Decision::Suppressed { .. })
    }

    pub fn incident(&self) -> Fingerprint {
        match self {
            Decision::NewIncident { incident }
            | Decision::RecurringStale { incident, .. }
            | Decision::Suppressed { incident } => *incident,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    AdmissionClosed(#[from] AdmissionClosed),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionStats {
    pub messages_processed: u64,
    pub new_incidents: u64,
    pub recurring_alerts: u64,
    pub suppressed: u64,
    pub incidents_evicted: u64,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    index: Mutex<SimilarityIndex>,
    admission: AdmissionSender,
    stats: RwLock<DecisionStats>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, admission: AdmissionSender) -> Self {
        Self {
            config,
            index: Mutex::new(SimilarityIndex::new()),
            admission,
            stats: RwLock::new(DecisionStats::default()),
        }
    }

    /// Fingerprint the message, decide, and queue an alert when one is due.
    ///
    /// The index lock is released before the alert is queued, so a full
    /// admission channel only holds up this message.
    pub async fn process(
        &self,
        envelope: LogEnvelope,
        arrival_time: DateTime<Utc>,
    ) -> Result<Decision, EngineError> {
        let message_fingerprint = fingerprint(&envelope.message);
        let decision = self.decide(message_fingerprint, arrival_time).await;

        let alert = match decision {
            Decision::NewIncident { incident } => AlertEvent::new(
                AlertKind::NewIncident,
                message_fingerprint,
                incident,
                arrival_time,
                envelope,
            ),
            Decision::RecurringStale {
                incident,
                previous_alert,
            } => AlertEvent::new(
                AlertKind::RecurringStale,
                message_fingerprint,
                incident,
                arrival_time,
                envelope,
            )
            .with_previous_alert(previous_alert),
            Decision::Suppressed { .. } => return Ok(decision),
        };

        self.admission.emit(alert).await?;
        Ok(decision)
    }

    /// The critical section: look up and update the index as one step.
    pub async fn decide(&self, fingerprint: Fingerprint, arrival_time: DateTime<Utc>) -> Decision {
        let decision = {
            let mut index = self.index.lock().await;

            match index.find_mut(fingerprint, self.config.similarity_threshold) {
                None => {
                    index.insert(fingerprint, arrival_time);
                    Decision::NewIncident {
                        incident: fingerprint,
                    }
                }
                Some(record) => {
                    if arrival_time - record.last_alerted_at() > self.config.realert_window() {
                        let previous_alert = record.touch(arrival_time);
                        Decision::RecurringStale {
                            incident: record.representative(),
                            previous_alert,
                        }
                    } else {
                        Decision::Suppressed {
                            incident: record.representative(),
                        }
                    }
                }
            }
        };

        let mut stats = self.stats.write().await;
        stats.messages_processed += 1;
        match decision {
            Decision::NewIncident { incident } => {
                stats.new_incidents += 1;
                info!("New incident {} (fingerprint {})", incident, fingerprint);
            }
            Decision::RecurringStale {
                incident,
                previous_alert,
            } => {
                stats.recurring_alerts += 1;
                info!(
                    "Recurring incident {} re-alerted (fingerprint {}, last alert {})",
                    incident, fingerprint, previous_alert
                );
            }
            Decision::Suppressed { incident } => {
                stats.suppressed += 1;
                debug!("Suppressed fingerprint {} as duplicate of {}", fingerprint, incident);
            }
        }

        decision
    }

    /// Drop incident classes idle past the configured horizon. No-op when unbounded.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let Some(horizon) = self.config.eviction_horizon() else {
            return 0;
        };

        let (evicted, remaining) = {
            let mut index = self.index.lock().await;
            let evicted = index.evict_idle(now, horizon);
            (evicted, index.len())
        };

        if evicted > 0 {
            self.stats.write().await.incidents_evicted += evicted as u64;
            info!("Evicted {} idle incidents, {} remain", evicted, remaining);
        }
        evicted
    }

    pub async fn incident_count(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn get_stats(&self) -> DecisionStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{self, AdmissionReceiver};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    const WINDOW: u64 = 3600;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn engine_with(
        threshold: u32,
        horizon: Option<u64>,
        capacity: usize,
    ) -> (DecisionEngine, AdmissionReceiver) {
        let (tx, rx) = admission::channel(capacity);
        let config = DecisionConfig {
            similarity_threshold: threshold,
            realert_window_secs: WINDOW,
            eviction_horizon_secs: horizon,
        };
        (DecisionEngine::new(config, tx), rx)
    }

    #[tokio::test]
    async fn test_suppression_window() {
        let (engine, _rx) = engine_with(3, None, 5);
        let m1 = Fingerprint(0);
        let m2 = Fingerprint(0b011);
        let m3 = Fingerprint(0b110);

        assert_eq!(engine.decide(m1, t(0)).await, Decision::NewIncident { incident: m1 });
        assert_eq!(engine.decide(m2, t(1)).await, Decision::Suppressed { incident: m1 });
        // Exactly at the window edge is still fresh.
        assert_eq!(
            engine.decide(m2, t(WINDOW as i64)).await,
            Decision::Suppressed { incident: m1 }
        );

        let stale_at = t(WINDOW as i64 + 1);
        assert_eq!(
            engine.decide(m3, stale_at).await,
            Decision::RecurringStale {
                incident: m1,
                previous_alert: t(0)
            }
        );

        let index = engine.index.lock().await;
        assert_eq!(index.len(), 1);
        let record = index.find(m1, 0).unwrap();
        assert_eq!(record.representative(), m1);
        assert_eq!(record.last_alerted_at(), stale_at);
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let (engine, _rx) = engine_with(3, None, 5);
        engine.decide(Fingerprint(0), t(0)).await;

        let at_threshold = engine.decide(Fingerprint(0b111), t(1)).await;
        assert!(!at_threshold.should_alert());

        let past_threshold = engine.decide(Fingerprint(0b1111_0000), t(2)).await;
        assert_eq!(
            past_threshold,
            Decision::NewIncident {
                incident: Fingerprint(0b1111_0000)
            }
        );
    }

    #[tokio::test]
    async fn test_first_inserted_incident_is_matched() {
        let (engine, _rx) = engine_with(4, None, 5);
        engine.decide(Fingerprint(0b0000), t(0)).await;
        // Five bits from the first record, so it opens its own class.
        engine.decide(Fingerprint(0b1_1111), t(1)).await;

        // Three bits from the first record, two from the second.
        let decision = engine.decide(Fingerprint(0b0_0111), t(2)).await;
        assert_eq!(decision.incident(), Fingerprint(0b0000));
    }

    #[tokio::test]
    async fn test_distinct_classes_accumulate() {
        let (engine, _rx) = engine_with(0, None, 5);
        for k in 0..100u64 {
            engine.decide(Fingerprint(k), t(k as i64)).await;
        }
        assert_eq!(engine.incident_count().await, 100);

        let stats = engine.get_stats().await;
        assert_eq!(stats.new_incidents, 100);
        assert_eq!(stats.messages_processed, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_duplicate_insert_under_contention() {
        let (engine, mut rx) = engine_with(3, None, 5);
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .process(LogEnvelope::from_text("OOM killed worker process 17"), t(0))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(engine.incident_count().await, 1);
        let first = rx.try_recv().expect("one alert");
        assert_eq!(first.kind, AlertKind::NewIncident);
        assert!(rx.try_recv().is_none(), "only one alert may be emitted");

        let stats = engine.get_stats().await;
        assert_eq!(stats.new_incidents, 1);
        assert_eq!(stats.suppressed, 63);
    }

    #[tokio::test]
    async fn test_full_admission_does_not_block_decisions() {
        let (engine, mut rx) = engine_with(3, None, 1);
        let engine = Arc::new(engine);

        // Fills the only slot.
        engine
            .process(LogEnvelope::from_text("disk quota exceeded on /var"), t(0))
            .await
            .unwrap();

        // A second new incident has nowhere to go and waits in emit.
        let blocked = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .process(LogEnvelope::from_text("certificate expired for api gateway"), t(1))
                    .await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Lookups keep flowing while that emitter is stuck.
        let decision = tokio::time::timeout(
            StdDuration::from_millis(200),
            engine.decide(fingerprint("disk quota exceeded on /var"), t(2)),
        )
        .await
        .expect("index lock must not be held across emit");
        assert!(!decision.should_alert());
        assert_eq!(engine.incident_count().await, 2);

        // Draining releases the blocked emitter.
        assert_eq!(rx.recv().await.unwrap().envelope.message, "disk quota exceeded on /var");
        blocked.await.unwrap().unwrap();
        assert_eq!(
            rx.recv().await.unwrap().envelope.message,
            "certificate expired for api gateway"
        );
    }

    #[tokio::test]
    async fn test_recurring_alert_carries_previous_time() {
        let (engine, mut rx) = engine_with(3, None, 5);
        let text = "upstream connect error or disconnect/reset before headers";

        engine.process(LogEnvelope::from_text(text), t(0)).await.unwrap();
        engine.process(LogEnvelope::from_text(text), t(10)).await.unwrap();
        let later = t(WINDOW as i64 + 60);
        engine.process(LogEnvelope::from_text(text), later).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, AlertKind::NewIncident);
        assert!(first.previous_alert.is_none());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, AlertKind::RecurringStale);
        assert_eq!(second.previous_alert, Some(t(0)));
        assert_eq!(second.arrival_time, later);
        assert_eq!(second.incident, first.incident);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_process_fails_once_consumer_is_gone() {
        let (engine, rx) = engine_with(3, None, 5);
        drop(rx);
        let result = engine.process(LogEnvelope::from_text("late message"), t(0)).await;
        assert!(matches!(result, Err(EngineError::AdmissionClosed(_))));
        // The decision itself still stands.
        assert_eq!(engine.incident_count().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_respects_window() {
        let (engine, _rx) = engine_with(0, Some(WINDOW * 2), 5);
        engine.decide(Fingerprint(1), t(0)).await;
        engine.decide(Fingerprint(2), t(WINDOW as i64)).await;

        // Both records are still inside the horizon.
        assert_eq!(engine.evict_idle(t(WINDOW as i64 * 2)).await, 0);

        assert_eq!(engine.evict_idle(t(WINDOW as i64 * 2 + 1)).await, 1);
        assert_eq!(engine.incident_count().await, 1);
        assert_eq!(engine.get_stats().await.incidents_evicted, 1);
    }

    #[tokio::test]
    async fn test_huge_window_saturates_instead_of_wrapping() {
        for window in [u64::MAX, 10_000_000_000_000_000, MAX_WINDOW_SECS] {
            let (tx, _rx) = admission::channel(5);
            let config = DecisionConfig {
                similarity_threshold: 0,
                realert_window_secs: window,
                eviction_horizon_secs: Some(window),
            };
            let engine = DecisionEngine::new(config, tx);

            engine.decide(Fingerprint(7), t(0)).await;
            assert_eq!(
                engine.decide(Fingerprint(7), t(1)).await,
                Decision::Suppressed { incident: Fingerprint(7) },
                "window {}",
                window
            );
            assert_eq!(engine.evict_idle(t(1)).await, 0);
        }
    }

    #[tokio::test]
    async fn test_eviction_disabled_by_default() {
        let (engine, _rx) = engine_with(0, None, 5);
        engine.decide(Fingerprint(1), t(0)).await;
        assert_eq!(engine.evict_idle(t(i64::from(u32::MAX))).await, 0);
        assert_eq!(engine.incident_count().await, 1);
    }
}
