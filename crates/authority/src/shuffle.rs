//! Cryptographically secure shuffling.

use rand::{rngs::OsRng, RngCore};

/// Draws a uniform index in `[0, bound)` from OS randomness using
/// rejection sampling, so no modulo bias leaks into validator selection.
fn uniform_index(bound: u32) -> u32 {
    debug_assert!(bound > 0);
    // Largest multiple of `bound` representable in u32.
    let zone = u32::MAX - (u32::MAX % bound);
    loop {
        let mut buf = [0u8; 4];
        OsRng.fill_bytes(&mut buf);
        let v = u32::from_le_bytes(buf);
        if v < zone {
            return v % bound;
        }
    }
}

/// Fisher-Yates over OS randomness. Never a non-secure PRNG: subset
/// selection feeds consensus-facing validator choices.
pub fn secure_shuffle<T>(items: &mut [T]) {
    let len = items.len();
    for i in (1..len).rev() {
        let j = uniform_index((i + 1) as u32) as usize;
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_shuffle_is_permutation() {
        let mut items: Vec<u32> = (0..100).collect();
        secure_shuffle(&mut items);
        let set: BTreeSet<u32> = items.iter().copied().collect();
        assert_eq!(set.len(), 100);
        assert_eq!(*set.iter().next().unwrap(), 0);
        assert_eq!(*set.iter().next_back().unwrap(), 99);
    }

    #[test]
    fn test_shuffle_handles_trivial_sizes() {
        let mut empty: Vec<u8> = vec![];
        secure_shuffle(&mut empty);
        let mut one = vec![7u8];
        secure_shuffle(&mut one);
        assert_eq!(one, vec![7]);
    }

    #[test]
    fn test_uniform_index_in_bounds() {
        for _ in 0..1000 {
            assert!(uniform_index(7) < 7);
        }
    }
}
