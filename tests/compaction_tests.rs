//! Tests for background compaction: the gating checks, the four-phase
//! rewrite, and the invariant that the key/value mapping is untouched.

use repkv::{Config, Role, Store};
use tempfile::TempDir;

/// compaction worker disabled so tests drive passes manually; thresholds
/// lowered so small fixtures qualify
fn test_config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .checkpoint_interval_secs(3600)
        .compaction_enabled(false)
        .compaction_threshold(0.3)
        .compaction_min_file_size(100)
        .build()
}

fn open_store(dir: &TempDir) -> Store {
    Store::open(test_config(dir), Role::Master).unwrap()
}

fn fill(store: &Store, count: usize) {
    for i in 0..count {
        let key = format!("key_{:03}", i);
        let value = format!("value_{:03}_{}", i, "x".repeat(100));
        store.put(key.as_bytes(), value.as_bytes()).unwrap();
    }
}

#[test]
fn empty_file_does_not_need_compaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert!(!store.should_compact());
    store.close().unwrap();
}

#[test]
fn small_file_does_not_need_compaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(b"key1", b"value1").unwrap();
    assert!(store.data_file_size() < 100);
    assert!(!store.should_compact());
    store.close().unwrap();
}

#[test]
fn file_without_dead_space_does_not_need_compaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);
    assert!(!store.should_compact());
    store.close().unwrap();
}

#[test]
fn deletions_make_compaction_needed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);

    // delete half: ~50% dead space, above the 30% threshold
    for i in (0..100).step_by(2) {
        store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
    }
    assert!(store.should_compact());
    store.close().unwrap();
}

#[test]
fn compaction_reclaims_dead_space() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);

    let size_before = store.data_file_size();
    for i in (0..100).step_by(2) {
        store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
    }
    // the append-only file has not shrunk yet
    assert_eq!(store.data_file_size(), size_before);
    assert_eq!(store.key_count(), 50);

    store.compact().unwrap();

    let size_after = store.data_file_size();
    assert!(size_after < size_before);
    let reclaimed = (size_before - size_after) as f64 / size_before as f64;
    assert!(reclaimed > 0.4 && reclaimed < 0.6, "reclaimed {}", reclaimed);
    assert_eq!(store.key_count(), 50);
    store.close().unwrap();
}

#[test]
fn compaction_preserves_the_mapping() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);
    for i in (0..100).step_by(2) {
        store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
    }

    store.compact().unwrap();

    for i in 0..100 {
        let key = format!("key_{:03}", i);
        let got = store.read(key.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None);
        } else {
            let want = format!("value_{:03}_{}", i, "x".repeat(100));
            assert_eq!(got, Some(want.into_bytes()));
        }
    }
    store.close().unwrap();
}

#[test]
fn overwrites_compact_too() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 50);
    // overwrite every key once: ~half the file is dead
    fill(&store, 50);

    let size_before = store.data_file_size();
    assert!(store.should_compact());
    store.compact().unwrap();

    assert!(store.data_file_size() < size_before);
    for i in 0..50 {
        let key = format!("key_{:03}", i);
        let want = format!("value_{:03}_{}", i, "x".repeat(100));
        assert_eq!(store.read(key.as_bytes()).unwrap(), Some(want.into_bytes()));
    }
    store.close().unwrap();
}

#[test]
fn compaction_keeps_one_backup_generation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);
    for i in 0..100 {
        store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
    }

    store.compact().unwrap();
    assert!(dir.path().join("data.db.old").exists());
    assert!(!dir.path().join("data.db.tmp").exists());
    store.close().unwrap();
}

#[test]
fn store_stays_usable_after_compaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    fill(&store, 100);
    for i in (0..100).step_by(2) {
        store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
    }
    store.compact().unwrap();

    store.put(b"fresh", b"after").unwrap();
    assert_eq!(store.read(b"fresh").unwrap(), Some(b"after".to_vec()));
    assert!(store.delete(b"key_001".as_ref()).unwrap());
    assert_eq!(store.read(b"key_001").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn restart_after_compaction_restores_state() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        fill(&store, 100);
        for i in (0..100).step_by(2) {
            store.delete(format!("key_{:03}", i).as_bytes()).unwrap();
        }
        store.compact().unwrap();
        store.put(b"post", b"compaction").unwrap();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.read(b"post").unwrap(), Some(b"compaction".to_vec()));
    assert_eq!(store.read(b"key_000").unwrap(), None);
    let want = format!("value_{:03}_{}", 1, "x".repeat(100));
    assert_eq!(store.read(b"key_001").unwrap(), Some(want.into_bytes()));
    store.close().unwrap();
}

#[test]
fn replica_refuses_manual_compaction() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(test_config(&dir), Role::Replica).unwrap();
    assert!(store.compact().is_err());
    store.close().unwrap();
}
