// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// The public operations (SPEC_FULL.md §4.5, §4.6): get/set/add/replace/
// delete/exists/increment/flush/stats, wired over the codec, hash index,
// zone allocator and lock table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backend::{AttachedSegment, SegmentBackend};
use crate::codec::{self, NIL};
use crate::constants::{
    Layout, BUCKET_COUNT, DEFAULT_SEGMENT_SIZE, MAX_CHUNK_PAYLOAD, MAX_KEY_LEN, MIN_SEGMENT_SIZE,
};
use crate::error::{CacheError, Result};
use crate::hash::bucket_index;
use crate::index;
use crate::locks::LockTable;
use crate::zone;

/// Tunable knobs for an attached engine (SPEC_FULL.md §10.4).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Desired segment size in bytes. `0` means `DEFAULT_SEGMENT_SIZE`.
    /// Always clamped to `MIN_SEGMENT_SIZE` and ignored once a segment exists.
    pub segment_size: usize,
    /// How long a lock acquisition waits before surfacing `CacheError::Locked`.
    pub lock_timeout: Duration,
    /// Process-local hit/miss count at which buffered stats flush into the
    /// shared counters (SPEC_FULL.md §4.6).
    pub stats_flush_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            lock_timeout: Duration::from_millis(500),
            stats_flush_threshold: 64,
        }
    }
}

/// Snapshot returned by [`Engine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: u64,
    pub bytes: u64,
    pub buckets_in_use: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

#[derive(Default)]
struct StatsBuffer {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsBuffer {
    fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_miss(&self) -> u64 {
        self.misses.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take(&self) -> (u64, u64) {
        (
            self.hits.swap(0, Ordering::Relaxed),
            self.misses.swap(0, Ordering::Relaxed),
        )
    }
}

/// An attached cache segment plus its process-local state. Detaches (and
/// flushes buffered stats) on drop.
pub struct Engine<B: SegmentBackend> {
    backend: Option<B>,
    segment: AttachedSegment,
    layout: Layout,
    config: EngineConfig,
    stats_buffer: StatsBuffer,
}

enum StoreMode {
    Upsert,
    AddOnly,
    ReplaceOnly,
}

impl<B: SegmentBackend> Engine<B> {
    /// Attach to (creating if necessary) the named segment.
    pub fn attach(name: &str, backend: B, config: EngineConfig) -> Result<Self> {
        let requested = if config.segment_size == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            config.segment_size
        };
        let requested = requested.max(MIN_SEGMENT_SIZE);
        let (segment, is_new) = backend.attach(name, requested)?;
        let layout = Layout::compute(segment.len());
        let engine = Self {
            backend: Some(backend),
            segment,
            layout,
            config,
            stats_buffer: StatsBuffer::default(),
        };
        if is_new {
            unsafe { engine.initialize_segment() };
        }
        Ok(engine)
    }

    fn locks(&self) -> LockTable<'_> {
        unsafe { LockTable::new(self.segment.as_mut_ptr(), self.layout) }
    }

    /// Detach from the segment early, flushing buffered stats first. After
    /// this, every operation returns `CacheError::Detached` instead of
    /// touching the (possibly now-unmapped) segment. Idempotent.
    pub fn detach(&mut self) -> Result<()> {
        let _ = self.flush_stats();
        if let Some(backend) = self.backend.take() {
            backend.detach();
        }
        Ok(())
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.backend.is_some() {
            Ok(())
        } else {
            Err(CacheError::Detached)
        }
    }

    unsafe fn initialize_segment(&self) {
        let base = self.segment.as_mut_ptr();
        let locks = self.locks();

        locks.segment().reset();
        locks.stats().reset();
        locks.ring().reset();

        for b in 0..BUCKET_COUNT {
            locks.bucket(b).reset();
            codec::write_bucket_slot(base, &self.layout, b, NIL);
        }
        for z in 0..self.layout.zone_count {
            locks.zone(z).reset();
            zone::reset_zone(base, &self.layout, z);
        }
        codec::write_oldest_zone_index(base, &self.layout, (self.layout.zone_count - 1) as u64);
    }

    fn truncate<'k>(&self, key: &'k [u8]) -> &'k [u8] {
        &key[..key.len().min(MAX_KEY_LEN)]
    }

    fn record_hit(&self) {
        let total = self.stats_buffer.record_hit();
        self.maybe_flush_stats(total);
    }

    fn record_miss(&self) {
        let total = self.stats_buffer.record_miss();
        self.maybe_flush_stats(total);
    }

    fn maybe_flush_stats(&self, buffered_total: u64) {
        if buffered_total >= self.config.stats_flush_threshold {
            let _ = self.flush_stats();
        }
    }

    /// Flush process-local hit/miss counters into the shared stats area.
    /// Best-effort: a lock timeout here just delays the flush to the next
    /// trigger or to `detach` (SPEC_FULL.md §4.6).
    fn flush_stats(&self) -> Result<()> {
        let (hits, misses) = self.stats_buffer.take();
        if hits == 0 && misses == 0 {
            return Ok(());
        }
        let locks = self.locks();
        match locks.lock_stats_exclusive(self.config.lock_timeout) {
            Some(_guard) => {
                unsafe { codec::add_stats(self.segment.as_mut_ptr(), &self.layout, hits, misses) };
                Ok(())
            }
            None => {
                // Put the counts back; they'll be retried on the next flush trigger.
                self.stats_buffer.hits.fetch_add(hits, Ordering::Relaxed);
                self.stats_buffer.misses.fetch_add(misses, Ordering::Relaxed);
                Err(CacheError::Locked)
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u8)>> {
        self.ensure_attached()?;
        let key = self.truncate(key);
        let b = bucket_index(key);
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let _bucket = locks
            .lock_bucket_shared(b, self.config.lock_timeout)
            .ok_or(CacheError::Locked)?;
        let base = self.segment.as_mut_ptr();

        let found = unsafe { index::lookup(base, &self.layout, b, key) }?;
        match found {
            Some(chunk) => {
                let (value, flags) = unsafe { (chunk.read_value(base), chunk.flags(base)) };
                self.record_hit();
                Ok(Some((value, flags)))
            }
            None => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.store(key, value, flags, StoreMode::Upsert)
    }

    pub fn add(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.store(key, value, flags, StoreMode::AddOnly)
    }

    pub fn replace(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.store(key, value, flags, StoreMode::ReplaceOnly)
    }

    fn store(&self, key: &[u8], value: &[u8], flags: u8, mode: StoreMode) -> Result<()> {
        self.ensure_attached()?;
        let key = self.truncate(key);
        if value.len() > MAX_CHUNK_PAYLOAD {
            return Err(CacheError::Oversize);
        }
        let b = bucket_index(key);
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let _bucket = locks
            .lock_bucket_exclusive(b, self.config.lock_timeout)
            .ok_or(CacheError::Locked)?;
        let base = self.segment.as_mut_ptr();

        let existing = unsafe { index::lookup(base, &self.layout, b, key) }?;

        match (&existing, &mode) {
            (None, StoreMode::ReplaceOnly) => return Err(CacheError::NotFound),
            (Some(_), StoreMode::AddOnly) => return Err(CacheError::Exists),
            _ => {}
        }

        if let Some(chunk) = &existing {
            if (value.len() as u64) <= unsafe { chunk.val_alloc_size(base) } {
                unsafe {
                    chunk.write_value(base, value);
                    chunk.set_flags(base, flags);
                }
                return Ok(());
            }

            // Doesn't fit in place. A failed/outgrown set always removes the
            // stale entry first, even if the fresh allocation below fails
            // (memcached compatibility, SPEC_FULL.md §7).
            unsafe { index::unlink(base, &self.layout, b, chunk) }?;
            let zone = self.layout.zone_of_offset(chunk.offset);
            let zone_guard = locks
                .lock_zone_exclusive(zone, self.config.lock_timeout)
                .ok_or(CacheError::Locked)?;
            unsafe { zone::free_chunk(base, &self.layout, zone, chunk) };
            drop(zone_guard);
        }

        self.allocate_and_link(&locks, b, key, value, flags)
    }

    /// Carve a fresh chunk for `key`/`value`, evicting the oldest zone if
    /// the newest one has no room (SPEC_FULL.md §4.2, §5).
    fn allocate_and_link(&self, locks: &LockTable<'_>, b: usize, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        let base = self.segment.as_mut_ptr();
        let timeout = self.config.lock_timeout;

        loop {
            let ring_guard = locks.lock_ring_exclusive(timeout).ok_or(CacheError::Locked)?;
            let oldest = unsafe { codec::read_oldest_zone_index(base, &self.layout) } as usize;
            let newest = zone::newest_zone_index(&self.layout, oldest);

            let newest_guard = locks
                .lock_zone_exclusive(newest, timeout)
                .ok_or(CacheError::Locked)?;

            if !unsafe { zone::needs_eviction(base, &self.layout, newest, value.len()) } {
                unsafe { zone::place_chunk(base, &self.layout, newest, b, key, value, flags) }?;
                return Ok(());
            }

            let oldest_guard = if oldest == newest {
                newest_guard
            } else {
                drop(newest_guard);
                match locks.lock_zone_exclusive(oldest, timeout) {
                    Some(g) => g,
                    None => {
                        drop(ring_guard);
                        std::thread::yield_now();
                        continue;
                    }
                }
            };

            let live_buckets = unsafe { zone::scan_live_buckets(base, &self.layout, oldest) }?;
            let mut extra_guards = Vec::with_capacity(live_buckets.len());
            let mut backoff = false;
            for lb in live_buckets {
                if lb == b {
                    continue; // already held exclusively by this call
                }
                match locks.try_lock_bucket_exclusive(lb) {
                    Some(g) => extra_guards.push(g),
                    None => {
                        backoff = true;
                        break;
                    }
                }
            }

            if backoff {
                log::warn!("eviction of zone {oldest} backing off: bucket contention");
                drop(extra_guards);
                drop(oldest_guard);
                drop(ring_guard);
                std::thread::yield_now();
                continue;
            }

            log::debug!("evicting zone {oldest}");
            unsafe { zone::evict_zone(base, &self.layout, oldest) }?;
            let new_oldest = (oldest + 1) % self.layout.zone_count;
            unsafe { codec::write_oldest_zone_index(base, &self.layout, new_oldest as u64) };
            drop(extra_guards);

            unsafe { zone::place_chunk(base, &self.layout, oldest, b, key, value, flags) }?;
            return Ok(());
        }
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_attached()?;
        let key = self.truncate(key);
        let b = bucket_index(key);
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let _bucket = locks
            .lock_bucket_exclusive(b, self.config.lock_timeout)
            .ok_or(CacheError::Locked)?;
        let base = self.segment.as_mut_ptr();

        if let Some(chunk) = unsafe { index::lookup(base, &self.layout, b, key) }? {
            unsafe { index::unlink(base, &self.layout, b, &chunk) }?;
            let zone = self.layout.zone_of_offset(chunk.offset);
            let zone_guard = locks
                .lock_zone_exclusive(zone, self.config.lock_timeout)
                .ok_or(CacheError::Locked)?;
            unsafe { zone::free_chunk(base, &self.layout, zone, &chunk) };
            drop(zone_guard);
        }
        Ok(())
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_attached()?;
        let key = self.truncate(key);
        let b = bucket_index(key);
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let _bucket = locks
            .lock_bucket_shared(b, self.config.lock_timeout)
            .ok_or(CacheError::Locked)?;
        let base = self.segment.as_mut_ptr();
        Ok(unsafe { index::lookup(base, &self.layout, b, key) }?.is_some())
    }

    /// `max(0, prior + delta)`, seeding `max(0, initial_value + delta)` on a
    /// miss (resolved ambiguity, SPEC_FULL.md §4.5/§9).
    pub fn increment(&self, key: &[u8], delta: i64, initial_value: i64) -> Result<u64> {
        self.ensure_attached()?;
        let key = self.truncate(key);
        let b = bucket_index(key);
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let _bucket = locks
            .lock_bucket_exclusive(b, self.config.lock_timeout)
            .ok_or(CacheError::Locked)?;
        let base = self.segment.as_mut_ptr();

        match unsafe { index::lookup(base, &self.layout, b, key) }? {
            Some(chunk) => {
                let current = unsafe { chunk.read_value(base) };
                let text = std::str::from_utf8(&current).map_err(|_| CacheError::NonNumeric)?;
                let prior: i64 = text.trim().parse().map_err(|_| CacheError::NonNumeric)?;
                let new_value = (prior.saturating_add(delta)).max(0) as u64;
                let encoded = new_value.to_string();

                if (encoded.len() as u64) <= unsafe { chunk.val_alloc_size(base) } {
                    unsafe { chunk.write_value(base, encoded.as_bytes()) };
                } else {
                    unsafe { index::unlink(base, &self.layout, b, &chunk) }?;
                    let zone = self.layout.zone_of_offset(chunk.offset);
                    let zone_guard = locks
                        .lock_zone_exclusive(zone, self.config.lock_timeout)
                        .ok_or(CacheError::Locked)?;
                    unsafe { zone::free_chunk(base, &self.layout, zone, &chunk) };
                    drop(zone_guard);
                    self.allocate_and_link(&locks, b, key, encoded.as_bytes(), 0)?;
                }
                Ok(new_value)
            }
            None => {
                let new_value = (initial_value.saturating_add(delta)).max(0) as u64;
                let encoded = new_value.to_string();
                self.allocate_and_link(&locks, b, key, encoded.as_bytes(), 0)?;
                Ok(new_value)
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.ensure_attached()?;
        let locks = self.locks();
        let _seg = locks.lock_segment_exclusive();
        let base = self.segment.as_mut_ptr();

        for b in 0..BUCKET_COUNT {
            unsafe { codec::write_bucket_slot(base, &self.layout, b, NIL) };
        }
        for z in 0..self.layout.zone_count {
            unsafe { zone::reset_zone(base, &self.layout, z) };
        }
        unsafe { codec::write_oldest_zone_index(base, &self.layout, (self.layout.zone_count - 1) as u64) };
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        self.ensure_attached()?;
        let locks = self.locks();
        let _seg = locks.lock_segment_shared();
        let base = self.segment.as_mut_ptr();

        let mut buckets_in_use = 0u64;
        for b in 0..BUCKET_COUNT {
            if unsafe { codec::read_bucket_slot(base, &self.layout, b) } != NIL {
                buckets_in_use += 1;
            }
        }

        let mut items = 0u64;
        let mut bytes = 0u64;
        for z in 0..self.layout.zone_count {
            for zc in unsafe { zone::walk_zone(base, &self.layout, z) }? {
                let val_size = unsafe { zc.chunk.val_size(base) };
                if val_size > 0 {
                    items += 1;
                    bytes += val_size;
                }
            }
        }

        let words = unsafe { codec::read_stats(base, &self.layout) };
        let (buffered_hits, buffered_misses) = (
            self.stats_buffer.hits.load(Ordering::Relaxed),
            self.stats_buffer.misses.load(Ordering::Relaxed),
        );

        Ok(CacheStats {
            items,
            bytes,
            buckets_in_use,
            get_hits: words.get_hits + buffered_hits,
            get_misses: words.get_misses + buffered_misses,
        })
    }
}

impl<B: SegmentBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}
