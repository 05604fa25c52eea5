//! Single-word Bloom filters.
//!
//! A filter is a plain `u64`. Each key sets [`HASH_COUNT`] bits chosen by
//! `xxhash64(key, seed=i) % 64`, so filters combine with a bitwise OR and
//! a check never yields a false negative.

use xxhash_rust::xxh64::xxh64;

/// Number of hash functions per key.
pub const HASH_COUNT: u64 = 3;

/// Returns a filter with no keys.
pub fn bloom_empty() -> u64 {
    0
}

fn mask(key: u64) -> u64 {
    let bytes = key.to_le_bytes();
    (0..HASH_COUNT).fold(0u64, |acc, seed| acc | (1u64 << (xxh64(&bytes, seed) % 64)))
}

/// Returns `filter` with `key` added.
pub fn bloom_add(filter: u64, key: u64) -> u64 {
    filter | mask(key)
}

/// Returns true if `key` may have been added to `filter`.
pub fn bloom_check(filter: u64, key: u64) -> bool {
    let m = mask(key);
    filter & m == m
}

/// Returns the union of two filters.
pub fn bloom_combine(a: u64, b: u64) -> u64 {
    a | b
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_filter_rejects() {
        // An empty filter can only accept a key whose mask is empty, which never happens.
        assert!(!bloom_check(bloom_empty(), 42));
    }

    #[test]
    fn test_combine_contains_both() {
        let a = bloom_add(bloom_empty(), 1);
        let b = bloom_add(bloom_empty(), 2);
        let both = bloom_combine(a, b);
        assert!(bloom_check(both, 1));
        assert!(bloom_check(both, 2));
    }

    proptest! {
        #[test]
        fn test_no_false_negatives(keys in prop::collection::vec(any::<u64>(), 1..64)) {
            let filter = keys.iter().fold(bloom_empty(), |f, &k| bloom_add(f, k));
            for k in keys {
                prop_assert!(bloom_check(filter, k));
            }
        }
    }
}
