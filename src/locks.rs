// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// The segment's embedded lock table (SPEC_FULL.md §5, §6A.1).
//
// Port of the single-word atomic rw-lock from the reference crate's
// rw_lock.rs, extended with a non-blocking try-exclusive and a
// bounded-timeout exclusive acquisition (neither of which the reference
// crate needed, since it never surfaces a `locked` error to its callers).
//
// Unlike the reference crate's `RwLock`, which is a standalone value a
// caller constructs with `RwLock::new()`, these lock words live at fixed
// offsets inside the mapped segment and are shared by unrelated processes —
// there is no owning value, only a borrow of the bytes for as long as the
// segment stays attached.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::constants::{Layout, BUCKET_COUNT, LOCK_WORD_SIZE};

const W_MASK: u32 = i32::MAX as u32;
const W_FLAG: u32 = W_MASK + 1;

#[inline]
fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A single named reader/writer lock, embedded at a fixed offset inside the
/// mapped segment. High bit of the word = writer held; low 31 bits = reader
/// count. Borrowed, never owned: the backing `AtomicU32` lives in shared
/// memory for as long as some process has the segment attached.
pub struct ShmRwLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> ShmRwLock<'a> {
    /// # Safety
    /// `ptr` must point to a valid, 4-byte-aligned `u32` inside the mapped
    /// segment, reserved exclusively for this lock for the lifetime `'a`.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        Self {
            word: &*(ptr as *const AtomicU32),
        }
    }

    /// Zero the lock word. Only safe when no other process can be
    /// concurrently holding or waiting on this lock (e.g. segment creation,
    /// under `flush`'s exclusive `SEGMENT` lock).
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Acquire the exclusive (write) lock, blocking indefinitely.
    pub fn lock(&self) {
        let mut k = 0u32;
        loop {
            let old = self.word.fetch_or(W_FLAG, Ordering::AcqRel);
            if old == 0 {
                return;
            }
            if old & W_FLAG == 0 {
                break; // readers present, no other writer — wait them out below
            }
            adaptive_yield(&mut k);
        }
        let mut k = 0u32;
        while self.word.load(Ordering::Acquire) & W_MASK != 0 {
            adaptive_yield(&mut k);
        }
    }

    /// Try to acquire the exclusive lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(0, W_FLAG, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the exclusive lock, giving up after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        while !self.try_lock() {
            if Instant::now() >= deadline {
                return false;
            }
            adaptive_yield(&mut k);
        }
        true
    }

    /// Release the exclusive lock.
    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Acquire a shared (read) lock, blocking indefinitely.
    pub fn lock_shared(&self) {
        let mut old = self.word.load(Ordering::Acquire);
        let mut k = 0u32;
        loop {
            if old & W_FLAG != 0 {
                adaptive_yield(&mut k);
                old = self.word.load(Ordering::Acquire);
            } else if self
                .word
                .compare_exchange_weak(old, old + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            } else {
                old = self.word.load(Ordering::Acquire);
            }
        }
    }

    /// Acquire a shared lock, giving up after `timeout`.
    pub fn lock_shared_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut old = self.word.load(Ordering::Acquire);
        let mut k = 0u32;
        loop {
            if old & W_FLAG == 0 {
                if self
                    .word
                    .compare_exchange_weak(old, old + 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                old = self.word.load(Ordering::Acquire);
                continue;
            }
            if Instant::now() >= deadline {
                return false;
            }
            adaptive_yield(&mut k);
            old = self.word.load(Ordering::Acquire);
        }
    }

    /// Release a shared lock.
    pub fn unlock_shared(&self) {
        self.word.fetch_sub(1, Ordering::Release);
    }
}

/// RAII guard for an exclusive lock, released on drop.
/// Mirrors the reference crate's `ScopedAccess` (locks on construction,
/// unlocks in `Drop`) applied to an embedded rather than a named OS lock.
pub struct ExclusiveGuard<'a> {
    lock: ShmRwLock<'a>,
}

impl<'a> ExclusiveGuard<'a> {
    fn new(lock: ShmRwLock<'a>) -> Self {
        lock.lock();
        Self { lock }
    }

    fn try_new(lock: ShmRwLock<'a>) -> Option<Self> {
        if lock.try_lock() {
            Some(Self { lock })
        } else {
            None
        }
    }

    fn with_timeout(lock: ShmRwLock<'a>, timeout: Duration) -> Option<Self> {
        if lock.lock_timeout(timeout) {
            Some(Self { lock })
        } else {
            None
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// RAII guard for a shared lock, released on drop.
pub struct SharedGuard<'a> {
    lock: ShmRwLock<'a>,
}

impl<'a> SharedGuard<'a> {
    fn new(lock: ShmRwLock<'a>) -> Self {
        lock.lock_shared();
        Self { lock }
    }

    fn with_timeout(lock: ShmRwLock<'a>, timeout: Duration) -> Option<Self> {
        if lock.lock_shared_timeout(timeout) {
            Some(Self { lock })
        } else {
            None
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// Indexes into the segment's lock area, handing out `ShmRwLock` borrows for
/// `SEGMENT`, `STATS`, `RING`, `BUCKET[b]`, and `ZONE[z]` (SPEC_FULL.md §6A.1).
pub struct LockTable<'a> {
    base: *mut u8,
    layout: Layout,
    _marker: std::marker::PhantomData<&'a ()>,
}

// Safety: every `ShmRwLock` handed out borrows disjoint bytes of the segment
// and is itself `Send + Sync` by construction (plain atomics).
unsafe impl Send for LockTable<'_> {}
unsafe impl Sync for LockTable<'_> {}

impl<'a> LockTable<'a> {
    /// # Safety
    /// `base` must point to a mapped region of at least `layout.total_size`
    /// bytes that stays valid for `'a`.
    pub unsafe fn new(base: *mut u8, layout: Layout) -> Self {
        Self {
            base,
            layout,
            _marker: std::marker::PhantomData,
        }
    }

    fn word_at(&self, index: usize) -> ShmRwLock<'a> {
        let offset = self.layout.lock_offset + index * LOCK_WORD_SIZE;
        unsafe { ShmRwLock::at(self.base.add(offset)) }
    }

    pub fn segment(&self) -> ShmRwLock<'a> {
        self.word_at(0)
    }

    pub fn stats(&self) -> ShmRwLock<'a> {
        self.word_at(1)
    }

    pub fn ring(&self) -> ShmRwLock<'a> {
        self.word_at(2)
    }

    pub fn bucket(&self, b: usize) -> ShmRwLock<'a> {
        debug_assert!(b < BUCKET_COUNT);
        self.word_at(3 + b)
    }

    pub fn zone(&self, z: usize) -> ShmRwLock<'a> {
        debug_assert!(z < self.layout.zone_count);
        self.word_at(3 + BUCKET_COUNT + z)
    }

    /// Total number of lock words in the area (for zero-init on segment creation).
    pub fn total_locks(&self) -> usize {
        3 + BUCKET_COUNT + self.layout.zone_count
    }

    /// Lock `SEGMENT` shared; used by every ordinary operation.
    pub fn lock_segment_shared(&self) -> SharedGuard<'a> {
        SharedGuard::new(self.segment())
    }

    /// Lock `SEGMENT` exclusive; used by `flush`/`destroy`.
    pub fn lock_segment_exclusive(&self) -> ExclusiveGuard<'a> {
        ExclusiveGuard::new(self.segment())
    }

    /// Lock `STATS` exclusive, with the configured timeout.
    pub fn lock_stats_exclusive(&self, timeout: Duration) -> Option<ExclusiveGuard<'a>> {
        ExclusiveGuard::with_timeout(self.stats(), timeout)
    }

    /// Lock `BUCKET[b]` exclusive, with the configured timeout.
    pub fn lock_bucket_exclusive(&self, b: usize, timeout: Duration) -> Option<ExclusiveGuard<'a>> {
        ExclusiveGuard::with_timeout(self.bucket(b), timeout)
    }

    /// Lock `BUCKET[b]` shared, with the configured timeout.
    pub fn lock_bucket_shared(&self, b: usize, timeout: Duration) -> Option<SharedGuard<'a>> {
        SharedGuard::with_timeout(self.bucket(b), timeout)
    }

    /// Try-exclusive on `BUCKET[b]`, non-blocking — the only form eviction
    /// is allowed to use while already holding `RING` + `ZONE[z]` (SPEC_FULL.md §5).
    pub fn try_lock_bucket_exclusive(&self, b: usize) -> Option<ExclusiveGuard<'a>> {
        ExclusiveGuard::try_new(self.bucket(b))
    }

    /// Lock `RING` exclusive, with the configured timeout.
    pub fn lock_ring_exclusive(&self, timeout: Duration) -> Option<ExclusiveGuard<'a>> {
        ExclusiveGuard::with_timeout(self.ring(), timeout)
    }

    /// Lock `ZONE[z]` exclusive, with the configured timeout.
    pub fn lock_zone_exclusive(&self, z: usize, timeout: Duration) -> Option<ExclusiveGuard<'a>> {
        ExclusiveGuard::with_timeout(self.zone(z), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc;
    use std::thread;

    fn fresh_word() -> Box<StdAtomicU32> {
        Box::new(StdAtomicU32::new(0))
    }

    unsafe fn lock_from(word: &StdAtomicU32) -> ShmRwLock<'_> {
        ShmRwLock::at(word as *const StdAtomicU32 as *mut u8)
    }

    #[test]
    fn basic_exclusive_roundtrip() {
        let word = fresh_word();
        let lock = unsafe { lock_from(&word) };
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn basic_shared_roundtrip() {
        let word = fresh_word();
        let lock = unsafe { lock_from(&word) };
        lock.lock_shared();
        lock.unlock_shared();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let word = fresh_word();
        let lock = unsafe { lock_from(&word) };
        lock.lock();
        let lock2 = unsafe { lock_from(&word) };
        assert!(!lock2.try_lock());
        lock.unlock();
        assert!(lock2.try_lock());
        lock2.unlock();
    }

    #[test]
    fn lock_timeout_expires_under_contention() {
        let word = fresh_word();
        let lock = unsafe { lock_from(&word) };
        lock.lock();
        let lock2 = unsafe { lock_from(&word) };
        assert!(!lock2.lock_timeout(Duration::from_millis(20)));
        lock.unlock();
    }

    #[test]
    fn writer_excludes_concurrent_readers() {
        let word = Arc::new(StdAtomicU32::new(0));
        let w = Arc::clone(&word);
        let writer_active = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let violation = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let wa = Arc::clone(&writer_active);
        let vi = Arc::clone(&violation);
        let handle = thread::spawn(move || {
            let lock = unsafe { lock_from(&w) };
            for _ in 0..50 {
                lock.lock();
                wa.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(50));
                wa.store(false, Ordering::SeqCst);
                lock.unlock();
                thread::yield_now();
            }
            let _ = vi;
        });

        let r = Arc::clone(&word);
        let wa2 = Arc::clone(&writer_active);
        let vi2 = Arc::clone(&violation);
        for _ in 0..50 {
            let lock = unsafe { lock_from(&r) };
            lock.lock_shared();
            if wa2.load(Ordering::SeqCst) {
                vi2.store(true, Ordering::SeqCst);
            }
            lock.unlock_shared();
            thread::yield_now();
        }

        handle.join().unwrap();
        assert!(!violation.load(Ordering::SeqCst));
    }
}
