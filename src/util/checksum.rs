//! Checksum and state-hash primitives.

use xxhash_rust::xxh64::xxh64;

/// 64-bit payload checksum used by changelog records and snapshot bodies.
pub fn checksum(payload: &[u8]) -> u64 {
  xxh64(payload, 0)
}

/// Checksum over discontiguous payload segments, equal to `checksum` of
/// their concatenation.
pub fn checksum_multi(segments: &[&[u8]]) -> u64 {
  let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
  for segment in segments {
    hasher.update(segment);
  }
  hasher.digest()
}

/// Folds one 64-bit value into the running automaton state hash.
pub fn combine_state_hash(state_hash: u64, value: u64) -> u64 {
  xxh64(&value.to_le_bytes(), state_hash)
}

/// 32-bit CRC used by sparse index entries.
pub fn index_crc(bytes: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(bytes);
  hasher.finalize()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn multi_matches_contiguous() {
    let whole = b"hello-world";
    assert_eq!(checksum(whole), checksum_multi(&[b"hello", b"-", b"world"]));
  }

  #[test]
  fn state_hash_chain_is_order_sensitive() {
    let a = combine_state_hash(combine_state_hash(0, 1), 2);
    let b = combine_state_hash(combine_state_hash(0, 2), 1);
    assert_ne!(a, b);
  }
}
