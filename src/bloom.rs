//! Bloom filter bit structure backing the membership index.
//!
//! FPR = (1 - e^(-kn/m))^k, with
//! - m = -n*ln(p) / (ln 2)^2 bits
//! - k = (m/n) * ln 2 hash functions
//!
//! Positions are derived from one 128-bit MurmurHash3 by double hashing,
//! h(i) = h1 + i * h2 (mod m).

use std::f64::consts::LN_2;
use std::io::Cursor;

use bitvec::prelude::*;

use crate::errors::DnsError;

/// Upper bound on hash functions; beyond this the filter only gets slower.
pub const MAX_HASH_COUNT: u32 = 32;

/// Sizing derived from an expected entry count and a target rate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BloomParams {
    /// Number of bits in the filter (m).
    pub size_bits: u64,
    /// Number of hash functions (k).
    pub hash_count: u32,
}

impl BloomParams {
    /// Optimal parameters for `capacity` entries at `target_fpr`.
    pub fn optimal(capacity: usize, target_fpr: f64) -> Result<Self, DnsError> {
        if !(target_fpr > 0.0 && target_fpr < 1.0) {
            return Err(DnsError::IndexBuild(format!(
                "false positive rate must be in (0, 1), got {target_fpr}"
            )));
        }

        let n = capacity.max(1) as f64;
        let m = (-n * target_fpr.ln() / (LN_2 * LN_2)).ceil();
        if !m.is_finite() || m > (usize::MAX / 2) as f64 {
            return Err(DnsError::IndexBuild(format!(
                "{capacity} entries at rate {target_fpr} needs too many bits"
            )));
        }
        let size_bits = (m as u64).max(8);

        let k = ((size_bits as f64 / n) * LN_2).round() as u32;

        Ok(Self {
            size_bits,
            hash_count: k.clamp(1, MAX_HASH_COUNT),
        })
    }
}

/// Expected false positive rate for `n` entries in `m` bits with `k` hashes.
pub fn expected_fpr(m: u64, n: u64, k: u32) -> f64 {
    if m == 0 {
        return 1.0;
    }
    let exponent = -(k as f64) * (n as f64) / (m as f64);
    (1.0 - exponent.exp()).powi(k as i32)
}

/// Probabilistic set of byte strings.
///
/// `contains` never returns `false` for an inserted element.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    k: u32,
    n: u64,
}

impl BloomFilter {
    pub fn new(params: BloomParams) -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; params.size_bits as usize],
            k: params.hash_count,
            n: 0,
        }
    }

    /// Rebuild a filter from its raw parts, as read back from a snapshot.
    ///
    /// Returns `None` when the parts cannot describe a valid filter.
    pub fn from_raw_parts(bytes: Vec<u8>, size_bits: u64, k: u32, n: u64) -> Option<Self> {
        if size_bits == 0 || k == 0 || k > MAX_HASH_COUNT {
            return None;
        }
        if (bytes.len() as u64) != size_bits.div_ceil(8) {
            return None;
        }
        let mut bits = BitVec::<u8, Lsb0>::from_vec(bytes);
        bits.truncate(size_bits as usize);
        Some(Self { bits, k, n })
    }

    pub fn insert(&mut self, element: &[u8]) {
        let m = self.bits.len() as u64;
        for pos in positions(element, self.k, m) {
            self.bits.set(pos, true);
        }
        self.n += 1;
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        let m = self.bits.len() as u64;
        positions(element, self.k, m).all(|pos| self.bits[pos])
    }

    /// Raw bit storage, `size_bits().div_ceil(8)` bytes long.
    pub fn as_raw_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn size_bits(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn hash_count(&self) -> u32 {
        self.k
    }

    /// Number of insert calls, duplicates included.
    pub fn elements_inserted(&self) -> u64 {
        self.n
    }

    pub fn bits_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Current false positive rate given the inserts so far.
    pub fn false_positive_rate(&self) -> f64 {
        expected_fpr(self.size_bits(), self.n, self.k)
    }
}

fn positions(element: &[u8], k: u32, m: u64) -> impl Iterator<Item = usize> {
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(element), 0).unwrap_or(0);
    let h1 = hash as u64;
    let h2 = ((hash >> 64) as u64) | 1;
    (0..k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimal_parameters_for_known_sizes() {
        // n=100, p=0.01 gives m≈959, k≈7
        let params = BloomParams::optimal(100, 0.01).unwrap();
        assert!((900..=1000).contains(&params.size_bits), "m={}", params.size_bits);
        assert!((6..=8).contains(&params.hash_count), "k={}", params.hash_count);

        // n=600k, p=0.001 is the default deployment: about 1 MiB, k=10
        let params = BloomParams::optimal(600_000, 0.001).unwrap();
        assert!(params.size_bits / 8 < 1_100_000);
        assert_eq!(params.hash_count, 10);
    }

    #[test]
    fn rejects_unusable_rates() {
        assert!(matches!(BloomParams::optimal(10, 0.0), Err(DnsError::IndexBuild(_))));
        assert!(matches!(BloomParams::optimal(10, 1.0), Err(DnsError::IndexBuild(_))));
        assert!(matches!(BloomParams::optimal(10, f64::NAN), Err(DnsError::IndexBuild(_))));
    }

    #[test]
    fn zero_capacity_still_yields_a_usable_filter() {
        let filter = BloomFilter::new(BloomParams::optimal(0, 0.01).unwrap());
        assert!(filter.size_bits() >= 8);
        assert!(!filter.contains(b"anything"));
    }

    #[test]
    fn inserted_elements_are_always_found() {
        let mut filter = BloomFilter::new(BloomParams::optimal(2_000, 0.01).unwrap());
        let elements: Vec<String> = (0..2_000).map(|i| format!("host{i}.tracker.net")).collect();

        for element in &elements {
            filter.insert(element.as_bytes());
        }

        for element in &elements {
            assert!(filter.contains(element.as_bytes()), "false negative for {element}");
        }
        assert_eq!(filter.elements_inserted(), 2_000);
    }

    #[test]
    fn raw_parts_round_trip() {
        let mut filter = BloomFilter::new(BloomParams { size_bits: 1_001, hash_count: 5 });
        filter.insert(b"ads.example.com");

        let restored = BloomFilter::from_raw_parts(
            filter.as_raw_bytes().to_vec(),
            filter.size_bits(),
            filter.hash_count(),
            filter.elements_inserted(),
        )
        .unwrap();

        assert!(restored.contains(b"ads.example.com"));
        assert_eq!(restored.size_bits(), 1_001);
        assert_eq!(restored.bits_set(), filter.bits_set());
    }

    #[test]
    fn raw_parts_reject_inconsistent_lengths() {
        assert!(BloomFilter::from_raw_parts(vec![0; 10], 1_000, 5, 0).is_none());
        assert!(BloomFilter::from_raw_parts(vec![0; 125], 1_000, 0, 0).is_none());
        assert!(BloomFilter::from_raw_parts(vec![0; 125], 1_000, 33, 0).is_none());
        assert!(BloomFilter::from_raw_parts(Vec::new(), 0, 5, 0).is_none());
    }

    #[test]
    fn expected_fpr_rises_with_load() {
        let light = expected_fpr(10_000, 100, 7);
        let heavy = expected_fpr(10_000, 5_000, 7);
        assert!(light < heavy);
        assert_eq!(expected_fpr(0, 1, 1), 1.0);
    }
}
