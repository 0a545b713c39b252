//! Tests for the store's client-facing operations: put, batch put, read,
//! range read, and delete.

use repkv::{Config, Role, Store};
use tempfile::TempDir;

/// a config pointing at the temp dir with the background workers effectively
/// quiesced, so tests control every state change
fn test_config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .checkpoint_interval_secs(3600)
        .compaction_enabled(false)
        .build()
}

fn open_store(dir: &TempDir) -> Store {
    Store::open(test_config(dir), Role::Master).unwrap()
}

#[test]
fn put_then_read() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"alpha", b"1").unwrap();
    store.put(b"beta", b"2").unwrap();

    assert_eq!(store.read(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.read(b"beta").unwrap(), Some(b"2".to_vec()));
    store.close().unwrap();
}

#[test]
fn read_missing_key_is_none() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert_eq!(store.read(b"nope").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn overwrite_then_delete() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"k", b"v1").unwrap();
    store.put(b"k", b"v2").unwrap();
    assert_eq!(store.read(b"k").unwrap(), Some(b"v2".to_vec()));

    assert!(store.delete(b"k").unwrap());
    assert_eq!(store.read(b"k").unwrap(), None);

    // a second delete finds nothing
    assert!(!store.delete(b"k").unwrap());
    store.close().unwrap();
}

#[test]
fn delete_missing_key_returns_false() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert!(!store.delete(b"ghost").unwrap());
    store.close().unwrap();
}

#[test]
fn batch_put_and_range() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .batch_put(
            &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            &[b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
        )
        .unwrap();

    let range = store.read_range(b"a", b"b").unwrap();
    assert_eq!(range.len(), 2);
    assert_eq!(range.get(b"a".as_ref()), Some(&b"1".to_vec()));
    assert_eq!(range.get(b"b".as_ref()), Some(&b"2".to_vec()));
    store.close().unwrap();
}

#[test]
fn range_is_inclusive_at_both_ends() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for key in &["a", "b", "ba", "c", "d"] {
        store.put(key.as_bytes(), b"x").unwrap();
    }

    let range = store.read_range(b"b", b"c").unwrap();
    let mut keys: Vec<_> = range.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec![b"b".to_vec(), b"ba".to_vec(), b"c".to_vec()]);
    store.close().unwrap();
}

#[test]
fn empty_range_is_empty_map() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(b"z", b"1").unwrap();
    assert!(store.read_range(b"a", b"b").unwrap().is_empty());
    store.close().unwrap();
}

#[test]
fn batch_put_length_mismatch_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let result = store.batch_put(&[b"a".to_vec(), b"b".to_vec()], &[b"1".to_vec()]);
    assert!(result.is_err());
    store.close().unwrap();
}

#[test]
fn empty_value_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(b"k", b"").unwrap();
    assert_eq!(store.read(b"k").unwrap(), Some(Vec::new()));
    store.close().unwrap();
}

#[test]
fn binary_keys_and_values_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let key = b"key with spaces\nand newlines".to_vec();
    let value = vec![0_u8, 1, 2, 255, 10, 13, 9, 92, 124];
    store.put(&key, &value).unwrap();
    assert_eq!(store.read(&key).unwrap(), Some(value));
    store.close().unwrap();
}

#[test]
fn data_file_grows_and_key_count_tracks_live_keys() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    assert_eq!(store.data_file_size(), 0);
    store.put(b"a", b"1").unwrap();
    store.put(b"b", b"2").unwrap();
    let size_after_puts = store.data_file_size();
    assert!(size_after_puts > 0);
    assert_eq!(store.key_count(), 2);

    // deletes do not shrink the append-only file
    store.delete(b"a").unwrap();
    assert_eq!(store.data_file_size(), size_after_puts);
    assert_eq!(store.key_count(), 1);
    store.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(b"k", b"v").unwrap();
    store.close().unwrap();
    store.close().unwrap();
}

#[test]
fn clones_share_one_engine() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let other = store.clone();

    store.put(b"k", b"v").unwrap();
    assert_eq!(other.read(b"k").unwrap(), Some(b"v".to_vec()));
    store.close().unwrap();
}
