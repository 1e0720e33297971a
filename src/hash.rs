// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Bucket index derivation (SPEC_FULL.md §4.3).

use crc32fast::Hasher;

use crate::constants::BUCKET_COUNT;

/// Maps `key` to a hash bucket in `0..BUCKET_COUNT`.
pub fn bucket_index(key: &[u8]) -> usize {
    let mut hasher = Hasher::new();
    hasher.update(key);
    (hasher.finalize() as usize) % BUCKET_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_in_range() {
        for k in [&b"a"[..], b"hello world", b"", &[0u8; 200][..]] {
            assert!(bucket_index(k) < BUCKET_COUNT);
        }
    }

    #[test]
    fn index_is_deterministic() {
        assert_eq!(bucket_index(b"same-key"), bucket_index(b"same-key"));
    }

    #[test]
    fn different_keys_can_collide_but_usually_dont_for_small_sets() {
        let idx_a = bucket_index(b"alpha");
        let idx_b = bucket_index(b"beta");
        assert_ne!(idx_a, idx_b);
    }
}
