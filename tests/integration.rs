//! AVALON - Integration Tests
//! End-to-end tests over the full store lifecycle:
//! open → put → get → delete → flush → sync → reopen.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use avalon::{Avalon, AvalonError, Config};

mod common {
    /// Config pointing at a temporary directory with a small memtable.
    pub fn temp_config(dir: &std::path::Path, capacity: usize) -> avalon::Config {
        let _ = env_logger::builder().is_test(true).try_init();
        avalon::Config::new(dir).with_memtable_capacity(capacity)
    }
}

fn open(dir: &std::path::Path, capacity: usize) -> Avalon<u32, String> {
    Avalon::open(common::temp_config(dir, capacity)).unwrap()
}

#[test]
fn test_capacity_three_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 3);

    engine.put(1, "1".into()).unwrap();
    engine.put(2, "2".into()).unwrap();
    engine.put(3, "3".into()).unwrap();
    engine.sync().unwrap();

    let segments = engine.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!((*segments[0].min_key(), *segments[0].max_key()), (1, 3));

    engine.put(4, "4".into()).unwrap();
    assert_eq!(engine.get(&1), Some("1".to_string()));
    assert_eq!(engine.get(&5), None);
}

#[test]
fn test_flush_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 100);

    for i in 0..100 {
        engine.put(i, format!("v{}", i)).unwrap();
    }
    // overwrite inside the buffer before it fills up again
    engine.put(0, "latest".into()).unwrap();
    engine.sync().unwrap();

    assert_eq!(engine.segment_count(), 1);
    assert_eq!(engine.memtable_len(), 1);
    assert_eq!(engine.get(&0), Some("latest".to_string()));
    for i in 1..100 {
        assert_eq!(engine.get(&i), Some(format!("v{}", i)));
    }
}

#[test]
fn test_newer_segment_shadows_older() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 10);

    engine.put(5, "a".into()).unwrap();
    engine.flush().unwrap();
    engine.put(5, "b".into()).unwrap();
    engine.flush().unwrap();
    engine.sync().unwrap();

    assert_eq!(engine.segment_count(), 2);
    assert_eq!(engine.memtable_len(), 0);
    assert_eq!(engine.get(&5), Some("b".to_string()));
}

#[test]
fn test_tombstone_shadows_older_segment() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 10);

    engine.put(5, "a".into()).unwrap();
    engine.put(6, "b".into()).unwrap();
    engine.flush().unwrap();
    engine.delete(5).unwrap();
    engine.flush().unwrap();
    engine.close().unwrap();

    let engine = open(dir.path(), 10);
    assert_eq!(engine.segment_count(), 2);
    assert_eq!(engine.get(&5), None);
    assert_eq!(engine.get(&6), Some("b".to_string()));

    // writing the key again revives it above the tombstone
    engine.put(5, "c".into()).unwrap();
    assert_eq!(engine.get(&5), Some("c".to_string()));
}

#[test]
fn test_max_key_reachable_through_segment() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 3);

    engine.put(10, "low".into()).unwrap();
    engine.put(20, "mid".into()).unwrap();
    engine.put(30, "high".into()).unwrap();
    engine.sync().unwrap();

    assert_eq!(engine.memtable_hidden_len(), 0);
    assert_eq!(*engine.segments()[0].max_key(), 30);
    assert_eq!(engine.get(&30), Some("high".to_string()));
    assert_eq!(engine.get(&10), Some("low".to_string()));
    assert_eq!(engine.get(&31), None);
    assert_eq!(engine.get(&9), None);
}

#[test]
fn test_reopen_continues_segment_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open(dir.path(), 2);
        for i in 0..4 {
            engine.put(i, i.to_string()).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 2);
    assert_eq!(engine.segment_count(), 2);
    engine.put(10, "ten".into()).unwrap();
    engine.put(11, "eleven".into()).unwrap();
    engine.sync().unwrap();

    let indices: Vec<u64> = engine.segments().iter().map(|s| s.index()).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(dir.path().join("segment_2").is_file());
    assert_eq!(engine.get(&3), Some("3".to_string()));
}

#[test]
fn test_ignores_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("segment_x"), b"junk").unwrap();
    fs::write(dir.path().join("segment_7.bak"), b"junk").unwrap();
    fs::write(dir.path().join("notes.txt"), b"junk").unwrap();

    let engine = open(dir.path(), 1);
    assert_eq!(engine.segment_count(), 0);
    engine.put(1, "one".into()).unwrap();
    engine.sync().unwrap();
    assert_eq!(engine.segments()[0].index(), 0);
}

#[test]
fn test_custom_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path(), 1).with_segment_prefix("run-");
    let engine: Avalon<u32, String> = Avalon::open(config).unwrap();

    engine.put(1, "one".into()).unwrap();
    engine.sync().unwrap();
    assert!(dir.path().join("run-0").is_file());
    assert!(!dir.path().join("segment_0").exists());
}

#[test]
fn test_data_dir_is_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("occupied");
    fs::write(&path, b"not a directory").unwrap();

    let result: avalon::Result<Avalon<u32, String>> = Avalon::open(common::temp_config(&path, 4));
    assert!(matches!(result, Err(AvalonError::StorageDir { .. })));
}

#[test]
fn test_corrupted_segment_skipped_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 2);

    engine.put(1, "one".into()).unwrap();
    engine.put(2, "two".into()).unwrap();
    engine.put(3, "three".into()).unwrap();
    engine.put(4, "four".into()).unwrap();
    engine.sync().unwrap();

    let path = engine.segments()[1].path().to_path_buf();
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    assert_eq!(engine.get(&3), None);
    assert_eq!(engine.get(&1), Some("one".to_string()));
    assert_eq!(engine.metrics().segment_read_errors.load(Ordering::Relaxed), 1);
}

#[test]
fn test_range_pruning_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path(), 2);

    for i in 1..=4 {
        engine.put(i, i.to_string()).unwrap();
    }
    engine.sync().unwrap();

    // segment [3,4] is newer and skipped by range, [1,2] is read
    assert_eq!(engine.get(&1), Some("1".to_string()));
    let metrics = engine.metrics();
    assert_eq!(metrics.segments_pruned.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.segments_probed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.flushes.load(Ordering::Relaxed), 2);
}

#[test]
fn test_keys_visible_while_flushing_through_rendezvous_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path(), 1).with_flush_queue_depth(0);
    let engine: Avalon<u32, String> = Avalon::open(config).unwrap();

    for i in 0..20 {
        engine.put(i, i.to_string()).unwrap();
        // every key stays visible while its memtable is in flight
        assert_eq!(engine.get(&i), Some(i.to_string()));
    }
    engine.sync().unwrap();

    assert_eq!(engine.segment_count(), 20);
    assert_eq!(engine.pending_flushes(), 0);
    for i in 0..20 {
        assert_eq!(engine.get(&i), Some(i.to_string()));
    }
}

#[test]
fn test_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::temp_config(dir.path(), 64).with_flush_queue_depth(2);
    let engine: Arc<Avalon<u32, u32>> = Arc::new(Avalon::open(config).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..250 {
                    let key = t * 1000 + i;
                    engine.put(key, key * 2).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    engine.sync().unwrap();

    assert!(engine.segment_count() >= 15);
    for t in 0..4u32 {
        for i in 0..250 {
            let key = t * 1000 + i;
            assert_eq!(engine.get(&key), Some(key * 2));
        }
    }
    assert_eq!(engine.metrics().puts.load(Ordering::Relaxed), 1000);
}
