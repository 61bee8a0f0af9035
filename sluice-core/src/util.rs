//! Utility functions for sluice

/// Safely truncates a string to a maximum number of characters.
///
/// Respects utf8 character boundaries.
pub fn safe_truncate_utf8(s: impl AsRef<str>, max_chars: usize) -> String {
    s.as_ref().chars().take(max_chars).collect()
}

/// Debug print a long string by truncating to n characters
///
/// # Example
///
/// ```
/// # use sluice_core::util::debug_long_utf8;
/// let s = debug_long_utf8("🦀".repeat(10), 3);
///
/// assert_eq!(s, "🦀🦀🦀 (10)");
/// ```
pub fn debug_long_utf8(s: impl AsRef<str>, max_chars: usize) -> String {
    let trunc = safe_truncate_utf8(&s, max_chars);

    format!("{} ({})", trunc, s.as_ref().chars().count())
}

/// Assigns `key` to one of `num_parts` buckets.
///
/// Uses the Kafka murmur2 hash so the result only depends on the bytes of the key: every node and
/// every release agree on which pipeline owns which partition.
pub fn hash_bucket(key: impl AsRef<[u8]>, num_parts: usize) -> usize {
    if num_parts <= 1 {
        return 0;
    }
    let hash = u64::from(murmur2(key.as_ref()) & 0x7fff_ffff);
    #[allow(clippy::cast_possible_truncation)]
    let bucket = (hash % num_parts as u64) as usize;
    bucket
}

/// Kafka compatible murmur2, seed `0x9747b28c`.
#[allow(clippy::cast_possible_truncation)]
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let rest = chunks.remainder();
    if rest.len() >= 3 {
        h ^= u32::from(rest[2]) << 16;
    }
    if rest.len() >= 2 {
        h ^= u32::from(rest[1]) << 8;
    }
    if let Some(&first) = rest.first() {
        h ^= u32::from(first);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_truncate_str_with_utf8_char_boundary() {
        let s = "🦀".repeat(101);

        // Single char
        assert_eq!(safe_truncate_utf8(&s, 100).chars().count(), 100);

        // With invalid char boundary
        let s = "Jürgen".repeat(100);
        assert_eq!(safe_truncate_utf8(&s, 100).chars().count(), 100);
    }

    #[test]
    fn test_hash_bucket_is_stable_and_in_range() {
        for item in ["shard-0", "shard-1", "shard-2", "shard-3"] {
            let bucket = hash_bucket(item, 3);
            assert!(bucket < 3);
            assert_eq!(bucket, hash_bucket(item, 3));
        }
        assert_eq!(hash_bucket("anything", 1), 0);
    }

    #[test]
    fn test_murmur2_matches_kafka() {
        assert_eq!(murmur2(b""), 275_646_681);
        assert_eq!(murmur2(b"hello"), 1_682_149_141);
        assert_eq!(murmur2(b"kafka"), 1_762_226_537);
    }

    #[test]
    fn test_hash_buckets_are_fixed_values() {
        // Persisted assignments depend on these staying put across builds.
        assert_eq!(hash_bucket("kafka", 3), 2);
        assert_eq!(hash_bucket("hello", 4), 1);
        assert_eq!(hash_bucket(b"hello".as_slice(), 4), 1);
    }
}
