//! Negative-cache bloom filter over KV bitmaps.
//!
//! A probabilistic "seen a 404 here before" oracle. No false negatives:
//! [`BloomProbe::DefinitelyNot`] means the origin has never 404'd this key,
//! so the pipeline can skip the `neg:` lookup entirely. The filter is
//! append-only; operators reset it by deleting the bitmap key.
//!
//! Sized from the standard formulas: `m = -n·ln(p)/(ln 2)²` bits and
//! `k = (m/n)·ln 2` hash functions. Positions come from double hashing the
//! SHA-256 digest of the item: `h_i = (h1 + i·h2) mod m`.

use crate::kv::{KvError, KvStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

const BITMAP_KEY: &str = "bloom:negative";

/// Probe result. `Maybe` carries the configured false-positive rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomProbe {
    Maybe,
    DefinitelyNot,
}

/// Distributed bloom filter backed by the shared KV store.
pub struct BloomFilter {
    kv: Arc<dyn KvStore>,
    bits: u64,
    hashes: u32,
}

impl BloomFilter {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, expected_items: u64, false_positive_rate: f64) -> Self {
        let bits = Self::optimal_bits(expected_items, false_positive_rate);
        let hashes = Self::optimal_hashes(bits, expected_items);
        debug!(bits, hashes, expected_items, "bloom filter sized");
        Self { kv, bits, hashes }
    }

    /// `m = ⌈-n·ln(p) / (ln 2)²⌉`
    #[must_use]
    pub fn optimal_bits(expected_items: u64, false_positive_rate: f64) -> u64 {
        if expected_items == 0 {
            return 1024;
        }
        let p = if false_positive_rate > 0.0 && false_positive_rate < 1.0 {
            false_positive_rate
        } else {
            0.01
        };
        let m = -(expected_items as f64) * p.ln() / (std::f64::consts::LN_2.powi(2));
        m.ceil() as u64
    }

    /// `k = ⌈(m/n)·ln 2⌉`, at least one.
    #[must_use]
    pub fn optimal_hashes(bits: u64, expected_items: u64) -> u32 {
        if expected_items == 0 {
            return 3;
        }
        let k = (bits as f64 / expected_items as f64) * std::f64::consts::LN_2;
        (k.ceil() as u32).max(1)
    }

    fn positions(&self, item: &str) -> Vec<u64> {
        let digest = Sha256::digest(item.as_bytes());
        let mut h1_bytes = [0u8; 8];
        let mut h2_bytes = [0u8; 8];
        h1_bytes.copy_from_slice(&digest[0..8]);
        h2_bytes.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_be_bytes(h1_bytes);
        let h2 = u64::from_be_bytes(h2_bytes);

        (0..u64::from(self.hashes))
            .map(|i| (h1.wrapping_add(i.wrapping_mul(h2))) % self.bits)
            .collect()
    }

    /// Marks an item as seen.
    ///
    /// # Errors
    /// Propagates [`KvError`]; the caller treats failures as a skipped hint.
    pub async fn add(&self, item: &str) -> Result<(), KvError> {
        self.kv.bits_set(BITMAP_KEY, &self.positions(item)).await
    }

    /// Checks whether an item may have been seen.
    ///
    /// # Errors
    /// Propagates [`KvError`]; the caller treats failures as a skipped hint.
    pub async fn probe(&self, item: &str) -> Result<BloomProbe, KvError> {
        let all_set = self.kv.bits_get(BITMAP_KEY, &self.positions(item)).await?;
        Ok(if all_set { BloomProbe::Maybe } else { BloomProbe::DefinitelyNot })
    }

    #[must_use]
    pub fn bit_size(&self) -> u64 {
        self.bits
    }

    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn filter() -> BloomFilter {
        BloomFilter::new(Arc::new(MemoryStore::new()), 1000, 0.01)
    }

    #[test]
    fn test_sizing_formulas() {
        // n = 10_000, p = 0.01 → m ≈ 95_851, k ≈ 7 (standard reference values).
        let bits = BloomFilter::optimal_bits(10_000, 0.01);
        assert!((95_000..97_000).contains(&bits), "unexpected bit count {bits}");
        assert_eq!(BloomFilter::optimal_hashes(bits, 10_000), 7);
    }

    #[test]
    fn test_sizing_degenerate_inputs() {
        assert_eq!(BloomFilter::optimal_bits(0, 0.01), 1024);
        assert!(BloomFilter::optimal_bits(100, -1.0) > 0, "bad p falls back to default");
        assert_eq!(BloomFilter::optimal_hashes(1024, 0), 3);
        assert!(BloomFilter::optimal_hashes(1, 1_000_000) >= 1);
    }

    #[test]
    fn test_positions_deterministic_and_in_range() {
        let bloom = filter();
        let a = bloom.positions("cache:abc");
        let b = bloom.positions("cache:abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), bloom.hash_count() as usize);
        assert!(a.iter().all(|&p| p < bloom.bit_size()));

        assert_ne!(a, bloom.positions("cache:abd"), "different items should differ");
    }

    #[tokio::test]
    async fn test_no_false_negatives() {
        let bloom = filter();
        let items: Vec<String> = (0..200).map(|i| format!("cache:item-{i}")).collect();
        for item in &items {
            bloom.add(item).await.unwrap();
        }
        for item in &items {
            assert_eq!(
                bloom.probe(item).await.unwrap(),
                BloomProbe::Maybe,
                "added item {item} must never probe as definitely-not"
            );
        }
    }

    #[tokio::test]
    async fn test_unseen_items_mostly_definitely_not() {
        let bloom = filter();
        for i in 0..100 {
            bloom.add(&format!("cache:present-{i}")).await.unwrap();
        }

        let mut maybes = 0;
        for i in 0..500 {
            if bloom.probe(&format!("cache:absent-{i}")).await.unwrap() == BloomProbe::Maybe {
                maybes += 1;
            }
        }
        // With n=1000 capacity and only 100 inserts the observed false
        // positive rate should be far below even 5%.
        assert!(maybes < 25, "false positive rate too high: {maybes}/500");
    }

    #[tokio::test]
    async fn test_probe_empty_filter() {
        let bloom = filter();
        assert_eq!(bloom.probe("cache:anything").await.unwrap(), BloomProbe::DefinitelyNot);
    }
}
