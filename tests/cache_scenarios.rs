// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Integration tests over the public engine API, covering the concrete
// scenarios the engine's invariants are checked against.

use std::time::Duration;

use shmkv::constants::{MAX_CHUNK_PAYLOAD, MIN_SEGMENT_SIZE};
use shmkv::{CacheError, Engine, EngineConfig, Layout, MemBackend};

fn small_engine() -> Engine<MemBackend> {
    let config = EngineConfig {
        segment_size: MIN_SEGMENT_SIZE,
        lock_timeout: Duration::from_millis(500),
        stats_flush_threshold: 1,
    };
    Engine::attach("scenario", MemBackend, config).unwrap()
}

#[test]
fn scenario_round_trip() {
    let e = small_engine();
    e.set(b"hello", b"world", 0).unwrap();
    assert_eq!(e.get(b"hello").unwrap().unwrap().0, b"world");
    assert!(e.exists(b"hello").unwrap());
    assert_eq!(e.stats().unwrap().items, 1);
}

#[test]
fn scenario_overwrite_in_place() {
    let e = small_engine();
    e.set(b"k", &vec![b'a'; 64], 0).unwrap();
    e.set(b"k", &vec![b'a'; 96], 0).unwrap();
    let (value, _) = e.get(b"k").unwrap().unwrap();
    assert_eq!(value.len(), 96);
}

#[test]
fn scenario_overwrite_grow_moves_chunk() {
    let e = small_engine();
    e.set(b"k", &vec![b'a'; 200], 0).unwrap();
    e.set(b"k", &vec![b'a'; 900_000], 0).unwrap();
    let (value, _) = e.get(b"k").unwrap().unwrap();
    assert_eq!(value.len(), 900_000);
}

#[test]
fn scenario_eviction_advances_oldest_zone() {
    let e = small_engine();
    let zone_count = Layout::compute(MIN_SEGMENT_SIZE).zone_count;
    let big = vec![b'x'; 900_000];

    let first_key = b"k0".to_vec();
    for i in 0..zone_count {
        e.set(format!("k{i}").as_bytes(), &big, 0).unwrap();
    }
    let last_key = format!("k{zone_count}");
    e.set(last_key.as_bytes(), &big, 0).unwrap();

    assert!(e.get(&first_key).unwrap().is_none());
    assert!(e.get(last_key.as_bytes()).unwrap().is_some());
}

#[test]
fn scenario_oversize_rejected() {
    let e = small_engine();
    let too_big = vec![0u8; MAX_CHUNK_PAYLOAD + 1];
    let err = e.set(b"k", &too_big, 0).unwrap_err();
    assert!(matches!(err, CacheError::Oversize));
    assert!(!e.exists(b"k").unwrap());
}

#[test]
fn scenario_increment() {
    let e = small_engine();
    assert_eq!(e.increment(b"ctr", 5, 10).unwrap(), 15);
    assert_eq!(e.increment(b"ctr", -20, 0).unwrap(), 0);
    assert_eq!(e.increment(b"ctr", 3, 0).unwrap(), 3);
    assert_eq!(e.increment(b"ctr2", 0, 7).unwrap(), 7);
}

#[test]
fn scenario_flush_clears_items_not_stats() {
    let e = small_engine();
    e.set(b"a", b"1", 0).unwrap();
    e.set(b"b", b"2", 0).unwrap();
    let _ = e.get(b"a").unwrap();
    let _ = e.get(b"missing").unwrap();

    let before = e.stats().unwrap();
    e.flush().unwrap();
    let after = e.stats().unwrap();

    assert_eq!(after.items, 0);
    assert_eq!(after.get_hits, before.get_hits);
    assert_eq!(after.get_misses, before.get_misses);
}

#[test]
fn scenario_add_replace_semantics() {
    let e = small_engine();
    assert!(matches!(e.replace(b"missing", b"v", 0), Err(CacheError::NotFound)));
    e.add(b"k", b"v1", 0).unwrap();
    assert!(matches!(e.add(b"k", b"v2", 0), Err(CacheError::Exists)));
    e.replace(b"k", b"v3", 0).unwrap();
    assert_eq!(e.get(b"k").unwrap().unwrap().0, b"v3");
}

#[test]
fn scenario_delete_is_idempotent() {
    let e = small_engine();
    e.set(b"k", b"v", 0).unwrap();
    e.delete(b"k").unwrap();
    assert!(e.get(b"k").unwrap().is_none());
    e.delete(b"k").unwrap();
}
