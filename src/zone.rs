// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Ring-buffer zone allocator (SPEC_FULL.md §4.2, §4.4). Operates on bytes
// already protected by whatever locks the caller holds — this module
// performs no locking, only the data-shuffling eviction/allocation/merge
// logic lives here. Bucket (un)linking during eviction is the caller's
// responsibility to lock around (see `crate::engine`).

use crate::codec::{self, zone_data_start, ChunkAccessor, NIL};
use crate::constants::{Layout, CHUNK_META_SIZE, MAX_CHUNK_PAYLOAD, MIN_VALUE_ALLOC, WORD_SIZE, ZONE_SIZE};
use crate::error::{CacheError, Result};
use crate::hash::bucket_index;
use crate::index;

/// The zone currently receiving new chunks: the one evicted most recently.
pub fn newest_zone_index(layout: &Layout, oldest_zone_index: usize) -> usize {
    if oldest_zone_index == 0 {
        layout.zone_count - 1
    } else {
        oldest_zone_index - 1
    }
}

/// Bytes still free to carve from in `zone`'s packed chunk stack.
///
/// # Safety
/// `base` must point to a mapped segment at least `layout.total_size` bytes long.
pub unsafe fn free_space(base: *const u8, layout: &Layout, zone: usize) -> usize {
    let used = codec::read_zone_used(base, layout, zone) as usize;
    (ZONE_SIZE - WORD_SIZE).saturating_sub(used)
}

/// Bytes a new chunk of `val_size` would need (header plus the larger of the
/// requested size and the minimum allocation).
pub fn required_space(val_size: usize) -> usize {
    CHUNK_META_SIZE + val_size.max(MIN_VALUE_ALLOC)
}

/// Whether allocating `val_size` bytes into `zone` as it stands would not fit.
///
/// # Safety
/// Same as [`free_space`].
pub unsafe fn needs_eviction(base: *const u8, layout: &Layout, zone: usize, val_size: usize) -> bool {
    free_space(base, layout, zone) < required_space(val_size)
}

/// One chunk found while walking a zone's used region, with the bucket it
/// belongs to (only meaningful for live chunks, `val_size > 0`).
pub struct ZoneChunk {
    pub chunk: ChunkAccessor,
    pub bucket: usize,
}

/// Walk zone `zone`'s packed chunk stack for its current `usedSpace` bytes,
/// returning every chunk record encountered (live or free).
///
/// The walk is bounded by `layout.max_chunk_count()`, and also rejects a
/// chunk reporting `total_size() == 0` (which would otherwise loop forever
/// at a fixed offset). Either condition means the zone's `usedSpace` header
/// or a chunk's `valAllocSize` has been corrupted, so this returns
/// `CacheError::Corrupt` rather than spinning or reading out of bounds.
///
/// # Safety
/// `base` must point to a mapped segment at least `layout.total_size` bytes long.
pub unsafe fn walk_zone(base: *const u8, layout: &Layout, zone: usize) -> Result<Vec<ZoneChunk>> {
    let used = codec::read_zone_used(base, layout, zone) as usize;
    let start = zone_data_start(layout, zone);
    let end = start + used;
    let bound = layout.max_chunk_count();

    let mut out = Vec::new();
    let mut offset = start;
    let mut steps = 0usize;
    while offset < end {
        if steps > bound {
            log::error!("zone {zone} chunk walk exceeds {bound} chunks, segment is corrupt");
            return Err(CacheError::Corrupt(format!(
                "zone {zone} chunk walk exceeds {bound} chunks"
            )));
        }
        steps += 1;
        let chunk = ChunkAccessor::new(offset);
        let total = chunk.total_size(base);
        if total == 0 {
            log::error!("zone {zone} chunk at offset {offset} has zero size, segment is corrupt");
            return Err(CacheError::Corrupt(format!(
                "zone {zone} chunk at offset {offset} has zero size"
            )));
        }
        let val_size = chunk.val_size(base);
        let bucket = if val_size > 0 {
            bucket_index(&chunk.read_key(base))
        } else {
            0
        };
        out.push(ZoneChunk { chunk, bucket });
        offset += total;
    }
    Ok(out)
}

/// Distinct buckets holding a live chunk in `zone`, for the caller to
/// try-lock before evicting (SPEC_FULL.md §5's multi-bucket reshape exception).
///
/// # Safety
/// Same as [`walk_zone`].
pub unsafe fn scan_live_buckets(base: *const u8, layout: &Layout, zone: usize) -> Result<Vec<usize>> {
    let mut buckets: Vec<usize> = walk_zone(base, layout, zone)?
        .into_iter()
        .filter(|zc| zc.chunk.val_size(base) > 0)
        .map(|zc| zc.bucket)
        .collect();
    buckets.sort_unstable();
    buckets.dedup();
    Ok(buckets)
}

/// Unlink every live chunk in `zone` from its bucket and reset the zone to a
/// single full-zone free chunk. The caller must already hold `ZONE[zone]`
/// exclusive and exclusive (try-)locks on every bucket `scan_live_buckets`
/// reported for this zone.
///
/// # Safety
/// Same as [`walk_zone`], plus the chunks must be in a zone already known to
/// be fully walkable (no corrupt chain lengths).
pub unsafe fn evict_zone(base: *mut u8, layout: &Layout, zone: usize) -> Result<()> {
    for zc in walk_zone(base, layout, zone)? {
        if zc.chunk.val_size(base) > 0 {
            index::unlink(base, layout, zc.bucket, &zc.chunk)?;
            zc.chunk.set_val_size(base, 0);
        }
    }

    let start = zone_data_start(layout, zone);
    let fresh = ChunkAccessor::new(start);
    fresh.write_key(base, b"");
    fresh.set_hash_next(base, NIL);
    fresh.set_val_alloc_size(base, MAX_CHUNK_PAYLOAD as u64);
    fresh.set_val_size(base, 0);
    fresh.set_flags(base, 0);
    codec::write_zone_used(base, layout, zone, 0);
    Ok(())
}

/// Re-initialize `zone` to a single full-zone free chunk and zero its used
/// space, without touching any bucket (used by `flush`, which already holds
/// every lock it needs via `SEGMENT` exclusive and has already cleared every
/// bucket head itself).
///
/// # Safety
/// Same as [`evict_zone`].
pub unsafe fn reset_zone(base: *mut u8, layout: &Layout, zone: usize) {
    let start = zone_data_start(layout, zone);
    let fresh = ChunkAccessor::new(start);
    fresh.write_key(base, b"");
    fresh.set_hash_next(base, NIL);
    fresh.set_val_alloc_size(base, MAX_CHUNK_PAYLOAD as u64);
    fresh.set_val_size(base, 0);
    fresh.set_flags(base, 0);
    codec::write_zone_used(base, layout, zone, 0);
}

/// Carve a new chunk for `key`/`value` from the top of `zone`'s stack,
/// linking it into bucket `b`. The caller must already know there is enough
/// free space (`needs_eviction` returned `false`, or eviction already ran)
/// and must already hold `ZONE[zone]` exclusive and `BUCKET[b]` exclusive.
///
/// # Safety
/// `base` must point to a mapped segment, and `zone` must have at least
/// `required_space(value.len())` bytes free.
pub unsafe fn place_chunk(
    base: *mut u8,
    layout: &Layout,
    zone: usize,
    b: usize,
    key: &[u8],
    value: &[u8],
    flags: u8,
) -> Result<ChunkAccessor> {
    let used = codec::read_zone_used(base, layout, zone);
    let offset = zone_data_start(layout, zone) + used as usize;
    let chunk = ChunkAccessor::new(offset);

    chunk.write_key(base, key);
    chunk.set_hash_next(base, NIL);
    chunk.set_flags(base, flags);
    chunk.write_value(base, value);

    let granted = value.len().max(MIN_VALUE_ALLOC);
    split(base, layout, zone, &chunk, granted as u64, used);

    index::link(base, layout, b, &chunk)?;

    let new_used = used + CHUNK_META_SIZE as u64 + chunk.val_alloc_size(base);
    codec::write_zone_used(base, layout, zone, new_used);

    Ok(chunk)
}

/// Shrink `chunk`'s allocation to `granted` bytes if the leftover is large
/// enough to stand alone as a free chunk, carving that leftover into a new
/// free tail and merging it with whatever free chunks already sit to its
/// right within `used_before` bytes of used space (SPEC_FULL.md §4.4).
///
/// # Safety
/// `base` must point to a mapped segment covering `chunk` and the rest of `zone`.
unsafe fn split(base: *mut u8, layout: &Layout, zone: usize, chunk: &ChunkAccessor, granted: u64, used_before: u64) {
    let current_alloc = chunk.val_alloc_size(base);
    if current_alloc <= granted {
        return;
    }
    let leftover = current_alloc - granted;
    if leftover < (CHUNK_META_SIZE + MIN_VALUE_ALLOC) as u64 {
        return;
    }

    chunk.set_val_alloc_size(base, granted);
    let new_offset = chunk.offset + CHUNK_META_SIZE + granted as usize;
    let tail = ChunkAccessor::new(new_offset);
    tail.write_key(base, b"");
    tail.set_hash_next(base, NIL);
    tail.set_val_alloc_size(base, leftover - CHUNK_META_SIZE as u64);
    tail.set_val_size(base, 0);
    tail.set_flags(base, 0);

    merge_right(base, layout, zone, &tail, used_before);
}

/// Absorb chunks immediately to the right of a free chunk `c`, as long as
/// they are themselves free and lie within `used_boundary` bytes of the
/// zone's used region.
///
/// # Safety
/// `base` must point to a mapped segment covering `zone`.
pub unsafe fn merge_right(base: *mut u8, layout: &Layout, zone: usize, c: &ChunkAccessor, used_boundary: u64) {
    let boundary_offset = zone_data_start(layout, zone) + used_boundary as usize;
    loop {
        let next_offset = c.offset + c.total_size(base);
        if next_offset >= boundary_offset {
            break;
        }
        let next = ChunkAccessor::new(next_offset);
        if next.val_size(base) != 0 {
            break;
        }
        let absorbed = next.total_size(base) as u64;
        c.set_val_alloc_size(base, c.val_alloc_size(base) + absorbed);
    }
}

/// Unlink `chunk` (already removed from its bucket by the caller), free its
/// space, and merge it with any free neighbors. If the freed chunk now sits
/// at the zone's top-of-stack, shrinks `usedSpace` to exclude it, turning it
/// back into the zone's implicit free tail rather than a recorded chunk.
///
/// # Safety
/// `base` must point to a mapped segment covering `zone`, and `chunk` must
/// already be unlinked from its bucket.
pub unsafe fn free_chunk(base: *mut u8, layout: &Layout, zone: usize, chunk: &ChunkAccessor) {
    chunk.set_val_size(base, 0);
    let used = codec::read_zone_used(base, layout, zone);
    merge_right(base, layout, zone, chunk, used);

    let top = zone_data_start(layout, zone) + used as usize;
    if chunk.offset + chunk.total_size(base) == top {
        let new_used = (chunk.offset - zone_data_start(layout, zone)) as u64;
        codec::write_zone_used(base, layout, zone, new_used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MIN_SEGMENT_SIZE;

    fn scratch() -> (Vec<u8>, Layout) {
        let layout = Layout::compute(MIN_SEGMENT_SIZE);
        let mut mem = vec![0u8; MIN_SEGMENT_SIZE];
        unsafe { reset_zone(mem.as_mut_ptr(), &layout, 0) };
        (mem, layout)
    }

    #[test]
    fn newest_zone_wraps_at_zero() {
        let layout = Layout::compute(MIN_SEGMENT_SIZE);
        assert_eq!(newest_zone_index(&layout, 0), layout.zone_count - 1);
        assert_eq!(newest_zone_index(&layout, 5), 4);
    }

    #[test]
    fn place_chunk_grants_minimum_allocation() {
        let (mut mem, layout) = scratch();
        let value = vec![b'a'; 64];
        unsafe {
            let chunk = place_chunk(mem.as_mut_ptr(), &layout, 0, 3, b"k", &value, 0).unwrap();
            assert_eq!(chunk.val_alloc_size(mem.as_ptr()), MIN_VALUE_ALLOC as u64);
            assert_eq!(chunk.val_size(mem.as_ptr()), 64);
        }
    }

    #[test]
    fn place_chunk_tracks_used_space() {
        let (mut mem, layout) = scratch();
        let value = vec![b'a'; 64];
        unsafe {
            place_chunk(mem.as_mut_ptr(), &layout, 0, 3, b"k", &value, 0).unwrap();
            let used = codec::read_zone_used(mem.as_ptr(), &layout, 0);
            assert_eq!(used, (CHUNK_META_SIZE + MIN_VALUE_ALLOC) as u64);
        }
    }

    #[test]
    fn needs_eviction_once_zone_fills_up() {
        let (mut mem, layout) = scratch();
        let value = vec![b'a'; 900_000];
        unsafe {
            assert!(!needs_eviction(mem.as_ptr(), &layout, 0, value.len()));
            place_chunk(mem.as_mut_ptr(), &layout, 0, 9, b"big", &value, 0).unwrap();
            assert!(needs_eviction(mem.as_ptr(), &layout, 0, value.len()));
        }
    }

    #[test]
    fn evict_zone_unlinks_live_chunks_and_resets() {
        let (mut mem, layout) = scratch();
        let value = vec![b'a'; 900_000];
        unsafe {
            let chunk = place_chunk(mem.as_mut_ptr(), &layout, 0, 9, b"big", &value, 0).unwrap();
            let b = bucket_index(b"big");
            assert!(index::lookup(mem.as_ptr(), &layout, b, b"big").unwrap().is_some());

            evict_zone(mem.as_mut_ptr(), &layout, 0).unwrap();

            assert!(index::lookup(mem.as_ptr(), &layout, b, b"big").unwrap().is_none());
            assert_eq!(codec::read_zone_used(mem.as_ptr(), &layout, 0), 0);
            let _ = chunk;
        }
    }

    #[test]
    fn free_chunk_shrinks_used_space_at_top_of_stack() {
        let (mut mem, layout) = scratch();
        let value = vec![b'a'; 64];
        unsafe {
            let chunk = place_chunk(mem.as_mut_ptr(), &layout, 0, 3, b"k", &value, 0).unwrap();
            let b = bucket_index(b"k");
            index::unlink(mem.as_mut_ptr(), &layout, b, &chunk).unwrap();
            free_chunk(mem.as_mut_ptr(), &layout, 0, &chunk);
            assert_eq!(codec::read_zone_used(mem.as_ptr(), &layout, 0), 0);
        }
    }
}
