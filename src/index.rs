// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Open-chained hash index over chunks stored in the zones area
// (SPEC_FULL.md §4.3). Callers must already hold `BUCKET[bucketIndex(key)]`
// exclusive (for `link`/`unlink`) or shared (for `lookup`) before calling
// into this module — it performs no locking of its own.

use crate::codec::{self, ChunkAccessor, NIL};
use crate::constants::Layout;
use crate::error::{CacheError, Result};

/// Walk bucket `b`'s chain looking for a live chunk whose key matches `key`.
///
/// The walk is bounded by `layout.max_chunk_count()`: a chain that exceeds it
/// can only mean a corrupted `hashNext` cycle, since that bound already
/// covers every chunk the segment could ever hold. Returns
/// `CacheError::Corrupt` in that case rather than spinning forever.
///
/// # Safety
/// `base` must point to a mapped segment at least `layout.total_size` bytes long.
pub unsafe fn lookup(base: *const u8, layout: &Layout, b: usize, key: &[u8]) -> Result<Option<ChunkAccessor>> {
    let bound = layout.max_chunk_count();
    let mut offset = codec::read_bucket_slot(base, layout, b);
    let mut steps = 0usize;
    while offset != NIL {
        if steps > bound {
            log::error!("bucket {b} hash chain exceeds {bound} chunks, segment is corrupt");
            return Err(CacheError::Corrupt(format!(
                "bucket {b} hash chain exceeds {bound} chunks"
            )));
        }
        steps += 1;
        let chunk = ChunkAccessor::new(offset as usize);
        if chunk.val_size(base) > 0 && chunk.read_key(base) == key {
            return Ok(Some(chunk));
        }
        offset = chunk.hash_next(base);
    }
    Ok(None)
}

/// Append `chunk` to the tail of bucket `b`'s chain (new entries are
/// inserted at the tail, so within-bucket order is insertion order).
///
/// Bounded the same way as [`lookup`].
///
/// # Safety
/// `base` must point to a mapped segment, `chunk` must not already be linked
/// anywhere, and its `hash_next` must already be `NIL`.
pub unsafe fn link(base: *mut u8, layout: &Layout, b: usize, chunk: &ChunkAccessor) -> Result<()> {
    let head = codec::read_bucket_slot(base, layout, b);
    if head == NIL {
        codec::write_bucket_slot(base, layout, b, chunk.offset as u64);
        return Ok(());
    }
    let bound = layout.max_chunk_count();
    let mut cursor = ChunkAccessor::new(head as usize);
    let mut steps = 0usize;
    loop {
        if steps > bound {
            log::error!("bucket {b} hash chain exceeds {bound} chunks, segment is corrupt");
            return Err(CacheError::Corrupt(format!(
                "bucket {b} hash chain exceeds {bound} chunks"
            )));
        }
        steps += 1;
        let next = cursor.hash_next(base);
        if next == NIL {
            cursor.set_hash_next(base, chunk.offset as u64);
            return Ok(());
        }
        cursor = ChunkAccessor::new(next as usize);
    }
}

/// Remove `chunk` from bucket `b`'s chain. `chunk.hash_next` is reset to
/// `NIL` regardless of whether it was found (callers always call this before
/// re-using or freeing the chunk). Bounded the same way as [`lookup`].
///
/// # Safety
/// `base` must point to a mapped segment.
pub unsafe fn unlink(base: *mut u8, layout: &Layout, b: usize, chunk: &ChunkAccessor) -> Result<()> {
    let head = codec::read_bucket_slot(base, layout, b);
    let target = chunk.offset as u64;

    if head == target {
        codec::write_bucket_slot(base, layout, b, chunk.hash_next(base));
        chunk.set_hash_next(base, NIL);
        return Ok(());
    }

    let bound = layout.max_chunk_count();
    let mut cursor = ChunkAccessor::new(head as usize);
    let mut steps = 0usize;
    loop {
        if steps > bound {
            log::error!("bucket {b} hash chain exceeds {bound} chunks, segment is corrupt");
            return Err(CacheError::Corrupt(format!(
                "bucket {b} hash chain exceeds {bound} chunks"
            )));
        }
        steps += 1;
        let next = cursor.hash_next(base);
        if next == NIL {
            // Not found in the chain — nothing to unlink.
            return Ok(());
        }
        if next == target {
            cursor.set_hash_next(base, chunk.hash_next(base));
            chunk.set_hash_next(base, NIL);
            return Ok(());
        }
        cursor = ChunkAccessor::new(next as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::zone_data_start;
    use crate::constants::{CHUNK_META_SIZE, MIN_SEGMENT_SIZE};

    fn scratch() -> (Vec<u8>, Layout) {
        let layout = Layout::compute(MIN_SEGMENT_SIZE);
        (vec![0u8; MIN_SEGMENT_SIZE], layout)
    }

    fn place_chunk(mem: &mut [u8], offset: usize, key: &[u8], val_alloc: u64) -> ChunkAccessor {
        let chunk = ChunkAccessor::new(offset);
        unsafe {
            chunk.write_key(mem.as_mut_ptr(), key);
            chunk.set_val_alloc_size(mem.as_mut_ptr(), val_alloc);
            chunk.write_value(mem.as_mut_ptr(), key);
        }
        chunk
    }

    #[test]
    fn link_then_lookup_finds_chunk() {
        let (mut mem, layout) = scratch();
        let off = zone_data_start(&layout, 0);
        let chunk = place_chunk(&mut mem, off, b"alpha", 128);
        unsafe {
            link(mem.as_mut_ptr(), &layout, 7, &chunk).unwrap();
            let found = lookup(mem.as_ptr(), &layout, 7, b"alpha").unwrap().expect("present");
            assert_eq!(found.offset, chunk.offset);
        }
    }

    #[test]
    fn tail_insertion_preserves_order() {
        let (mut mem, layout) = scratch();
        let stride = CHUNK_META_SIZE + 128;
        let off_a = zone_data_start(&layout, 0);
        let off_b = off_a + stride;
        let a = place_chunk(&mut mem, off_a, b"a", 128);
        let b = place_chunk(&mut mem, off_b, b"b", 128);
        unsafe {
            link(mem.as_mut_ptr(), &layout, 1, &a).unwrap();
            link(mem.as_mut_ptr(), &layout, 1, &b).unwrap();
            assert_eq!(codec::read_bucket_slot(mem.as_ptr(), &layout, 1), a.offset as u64);
            assert_eq!(a.hash_next(mem.as_ptr()), b.offset as u64);
            assert_eq!(b.hash_next(mem.as_ptr()), NIL);
        }
    }

    #[test]
    fn unlink_head_promotes_successor() {
        let (mut mem, layout) = scratch();
        let stride = CHUNK_META_SIZE + 128;
        let off_a = zone_data_start(&layout, 0);
        let off_b = off_a + stride;
        let a = place_chunk(&mut mem, off_a, b"a", 128);
        let b = place_chunk(&mut mem, off_b, b"b", 128);
        unsafe {
            link(mem.as_mut_ptr(), &layout, 2, &a).unwrap();
            link(mem.as_mut_ptr(), &layout, 2, &b).unwrap();
            unlink(mem.as_mut_ptr(), &layout, 2, &a).unwrap();
            assert_eq!(codec::read_bucket_slot(mem.as_ptr(), &layout, 2), b.offset as u64);
            assert!(lookup(mem.as_ptr(), &layout, 2, b"a").unwrap().is_none());
            assert!(lookup(mem.as_ptr(), &layout, 2, b"b").unwrap().is_some());
        }
    }

    #[test]
    fn unlink_middle_relinks_predecessor() {
        let (mut mem, layout) = scratch();
        let stride = CHUNK_META_SIZE + 128;
        let off_a = zone_data_start(&layout, 0);
        let off_b = off_a + stride;
        let off_c = off_b + stride;
        let a = place_chunk(&mut mem, off_a, b"a", 128);
        let b = place_chunk(&mut mem, off_b, b"b", 128);
        let c = place_chunk(&mut mem, off_c, b"c", 128);
        unsafe {
            link(mem.as_mut_ptr(), &layout, 3, &a).unwrap();
            link(mem.as_mut_ptr(), &layout, 3, &b).unwrap();
            link(mem.as_mut_ptr(), &layout, 3, &c).unwrap();
            unlink(mem.as_mut_ptr(), &layout, 3, &b).unwrap();
            assert_eq!(a.hash_next(mem.as_ptr()), c.offset as u64);
            assert!(lookup(mem.as_ptr(), &layout, 3, b"b").unwrap().is_none());
        }
    }

    #[test]
    fn lookup_reports_corrupt_on_cyclic_chain() {
        let (mut mem, layout) = scratch();
        let off = zone_data_start(&layout, 0);
        let chunk = place_chunk(&mut mem, off, b"a", 128);
        unsafe {
            // A chunk whose hashNext points back to itself never reaches NIL.
            chunk.set_hash_next(mem.as_mut_ptr(), chunk.offset as u64);
            codec::write_bucket_slot(mem.as_mut_ptr(), &layout, 5, chunk.offset as u64);
            let err = lookup(mem.as_ptr(), &layout, 5, b"missing").unwrap_err();
            assert!(matches!(err, CacheError::Corrupt(_)));
        }
    }
}
