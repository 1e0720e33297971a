// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Fixed-layout constants for the shared segment.
// Word width is fixed at 8 bytes (u64) for every offset/count stored in the
// segment: this targets 64-bit hosts exclusively and is baked into the
// layout, so it is never made generic (see DESIGN.md).

/// Width, in bytes, of every offset/count field stored in the segment.
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Maximum stored key length, in bytes. Keys are space-padded to this width.
pub const MAX_KEY_LEN: usize = 200;

/// Number of hash buckets.
pub const BUCKET_COUNT: usize = 512;

/// Size of one eviction zone.
pub const ZONE_SIZE: usize = 1024 * 1024;

/// Minimum allocation granted to a chunk's value, even for tiny values.
pub const MIN_VALUE_ALLOC: usize = 128;

/// Segment size used when the caller does not specify one.
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

/// Smallest segment size this engine will attach to.
pub const MIN_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Guard gap inserted between layout areas.
pub const SAFE_GAP: usize = 1024;

/// Fixed size reserved for the meta area (only the first `WORD_SIZE` bytes are used).
pub const META_AREA_SIZE: usize = 1024;

/// Fixed size reserved for the stats area (only the first `2 * WORD_SIZE` bytes are used).
pub const STATS_AREA_SIZE: usize = 1024;

/// Bytes of chunk header preceding the value payload:
/// `key[MAX_KEY_LEN]` + `hashNext:W` + `valAllocSize:W` + `valSize:W` + `flags:u8`.
pub const CHUNK_META_SIZE: usize = MAX_KEY_LEN + 3 * WORD_SIZE + 1;

/// Largest value payload a single chunk can ever hold in one zone.
pub const MAX_CHUNK_PAYLOAD: usize = ZONE_SIZE - WORD_SIZE - CHUNK_META_SIZE;

/// Flag bit: the stored value was serialized by the caller rather than raw bytes.
/// Stored and returned verbatim; never interpreted by this crate.
pub const FLAG_SERIALIZED: u8 = 1 << 0;

const _: () = assert!(MAX_CHUNK_PAYLOAD > MIN_VALUE_ALLOC);

/// Computed byte offsets of the segment's five fixed areas (see SPEC_FULL.md §2, §6).
///
/// `zone_count` is derived from whatever space remains for the zones area
/// after the meta/stats/lock/bucket areas and their guard gaps, via
/// `floor(zones_area_size / ZONE_SIZE)` — not `min`, which was a leftover
/// bug in the source this crate's design was distilled from.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub total_size: usize,
    pub meta_offset: usize,
    pub stats_offset: usize,
    pub lock_offset: usize,
    pub bucket_offset: usize,
    pub zones_offset: usize,
    pub zone_count: usize,
}

impl Layout {
    /// Lock words needed: SEGMENT + STATS + RING + one per bucket + one per zone.
    const FIXED_LOCKS: usize = 3;

    /// Compute the layout for a segment of `total_size` bytes, clamped to
    /// `MIN_SEGMENT_SIZE`.
    ///
    /// `zone_count` depends on the lock area's size, which itself depends on
    /// `zone_count` (each zone needs a lock word). We break the cycle by
    /// solving directly: the lock area grows by 4 bytes per zone, and the
    /// zones area shrinks by `ZONE_SIZE` bytes per zone, so there is exactly
    /// one largest `zone_count` for which everything still fits.
    pub fn compute(total_size: usize) -> Self {
        let total_size = total_size.max(MIN_SEGMENT_SIZE);

        let meta_offset = 0;
        let stats_offset = meta_offset + META_AREA_SIZE + SAFE_GAP;
        let lock_offset = stats_offset + STATS_AREA_SIZE + SAFE_GAP;

        // Bytes available to lock area + bucket area + zones area + the two
        // guard gaps that separate them.
        let remaining = total_size.saturating_sub(lock_offset);
        let bucket_bytes = BUCKET_COUNT * WORD_SIZE;
        let fixed_lock_bytes = Self::FIXED_LOCKS * LOCK_WORD_SIZE;
        let bucket_lock_bytes = BUCKET_COUNT * LOCK_WORD_SIZE;

        // remaining = fixed_lock_bytes + bucket_lock_bytes + zone_count*LOCK_WORD_SIZE
        //           + SAFE_GAP + bucket_bytes + SAFE_GAP + zone_count*ZONE_SIZE
        let overhead = fixed_lock_bytes + bucket_lock_bytes + 2 * SAFE_GAP + bucket_bytes;
        let per_zone = ZONE_SIZE + LOCK_WORD_SIZE;
        let zone_count = remaining.saturating_sub(overhead) / per_zone;
        assert!(zone_count > 0, "segment too small to hold even one zone");

        let lock_area_size = (Self::FIXED_LOCKS + BUCKET_COUNT + zone_count) * LOCK_WORD_SIZE;
        let bucket_offset = lock_offset + lock_area_size + SAFE_GAP;
        let zones_offset = bucket_offset + bucket_bytes + SAFE_GAP;

        Self {
            total_size,
            meta_offset,
            stats_offset,
            lock_offset,
            bucket_offset,
            zones_offset,
            zone_count,
        }
    }

    pub fn zone_start(&self, zone: usize) -> usize {
        debug_assert!(zone < self.zone_count);
        self.zones_offset + zone * ZONE_SIZE
    }

    pub fn bucket_slot_offset(&self, bucket: usize) -> usize {
        debug_assert!(bucket < BUCKET_COUNT);
        self.bucket_offset + bucket * WORD_SIZE
    }

    /// Which zone a chunk at absolute `offset` belongs to.
    pub fn zone_of_offset(&self, offset: usize) -> usize {
        (offset - self.zones_offset) / ZONE_SIZE
    }

    /// Upper bound on the number of chunks that could ever exist in the
    /// segment at once (every zone packed with minimum-size chunks). Used to
    /// bound hash-chain and zone walks so a corrupted segment yields
    /// `CacheError::Corrupt` instead of spinning forever.
    pub fn max_chunk_count(&self) -> usize {
        (self.zone_count * ZONE_SIZE) / (CHUNK_META_SIZE + MIN_VALUE_ALLOC)
    }
}

/// Size, in bytes, of one lock word in the lock area (see `crate::locks`).
pub const LOCK_WORD_SIZE: usize = 4;
