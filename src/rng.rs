//! Deterministic randomness derived from a game seed plus a salt string.
//!
//! Every ordering decision in a game (speaker order, debate queues, opening
//! variants, human placement) flows through `stable_int`, so two games with
//! the same seed replay identically across processes.

use sha2::{Digest, Sha256};

/// First 63 bits of SHA-256 over `"{seed}:{salt}"`.
pub fn stable_int(seed: i64, salt: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", seed, salt).as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) >> 1
}

/// Small xorshift64* stream used to drive the shuffle. Seeded from
/// `stable_int`, so the whole sequence is pinned by (seed, salt).
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // xorshift requires a nonzero state
        let state = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

/// Fisher–Yates shuffle seeded from `stable_int(seed, salt)`.
pub fn deterministic_shuffle(items: &[String], seed: i64, salt: &str) -> Vec<String> {
    let mut out: Vec<String> = items.to_vec();
    let mut rng = XorShift64::new(stable_int(seed, salt));
    for i in (1..out.len()).rev() {
        let j = (rng.next() % (i as u64 + 1)) as usize;
        out.swap(i, j);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<String> {
        ["BRA", "CAN", "CHN", "EU", "TZA", "USA"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn unit_stable_int_is_deterministic_and_fits_63_bits() {
        let a = stable_int(1234, "round1-countries");
        let b = stable_int(1234, "round1-countries");
        assert_eq!(a, b);
        assert!(a < (1u64 << 63));

        // Different salts diverge
        assert_ne!(a, stable_int(1234, "round1-ngos"));
        // Different seeds diverge
        assert_ne!(a, stable_int(1235, "round1-countries"));
    }

    #[test]
    fn unit_shuffle_is_a_permutation_and_stable_across_calls() {
        let items = roster();
        let first = deterministic_shuffle(&items, 9999, "round1-countries");
        let second = deterministic_shuffle(&items, 9999, "round1-countries");
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, items);
    }

    #[test]
    fn unit_shuffle_varies_with_seed_and_salt() {
        let items = roster();
        let base = deterministic_shuffle(&items, 1, "a");
        let other_seed = deterministic_shuffle(&items, 2, "a");
        let other_salt = deterministic_shuffle(&items, 1, "b");
        // With 720 permutations a collision on both is effectively a broken stream.
        assert!(base != other_seed || base != other_salt);
    }
}
