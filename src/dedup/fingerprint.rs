// SimHash fingerprints over free-text log messages.
// Messages sharing most of their tokens land a few bits apart; unrelated
// messages differ in roughly half of the 64 bits.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Word features: a run of word characters, optionally carrying a `://path` tail
/// so URLs stay a single token.
static WORD_FEATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\w']+(?:://[\w./]+)?").expect("word feature pattern is valid")
});

const WIDTH: usize = 64;

/// A 64-bit locality-sensitive fingerprint of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Hamming distance between two fingerprints.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        distance(*self, *other)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Popcount of `a XOR b`, in `0..=64`.
pub fn distance(a: Fingerprint, b: Fingerprint) -> u32 {
    (a.0 ^ b.0).count_ones()
}

/// Fingerprint a message. Pure and deterministic; empty text yields `Fingerprint(0)`.
pub fn fingerprint(text: &str) -> Fingerprint {
    let lowered = text.to_lowercase();
    let mut weights = [0i64; WIDTH];

    for feature in WORD_FEATURE.find_iter(&lowered) {
        let hash = feature_hash(feature.as_str());
        for (bit, weight) in weights.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let bits = weights
        .iter()
        .enumerate()
        .filter(|(_, weight)| **weight > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit));

    Fingerprint(bits)
}

/// 64-bit hash of a single feature: the leading 8 bytes of its SHA-256 digest.
pub fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
