//! The in-memory index and its on-disk snapshot.
//!
//! The index is a plain hash map from key to the `(offset, length)` of the
//! newest record for that key in the data file. Range reads scan the whole
//! map; there is no ordered structure on disk or in memory.
//!
//! `save` writes a complete snapshot to a temp file, fsyncs it, and renames
//! it over the live snapshot so a crash can never leave a half-written file
//! in place. `load` treats a missing or malformed snapshot as empty and lets
//! WAL replay rebuild the rest.
//!
//! The index is not internally synchronized; the store's data lock governs
//! all access.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Where a key's newest record lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// byte offset of the record's first byte
    pub offset: u64,
    /// total record length in bytes
    pub len: u64,
}

/// In-memory map from key to data file location, with a persisted snapshot.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    map: HashMap<Vec<u8>, Location>,
}

impl Index {
    /// create an index backed by the snapshot file at `path`, loading the
    /// snapshot if one exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Index> {
        let mut index = Index {
            path: path.as_ref().to_path_buf(),
            map: HashMap::new(),
        };
        index.load()?;
        Ok(index)
    }

    /// add or replace the location for `key`
    pub fn put(&mut self, key: Vec<u8>, location: Location) {
        self.map.insert(key, location);
    }

    /// look up the location for `key`
    pub fn get(&self, key: &[u8]) -> Option<Location> {
        self.map.get(key).copied()
    }

    /// remove `key`; returns its old location if it was present
    pub fn delete(&mut self, key: &[u8]) -> Option<Location> {
        self.map.remove(key)
    }

    /// all entries whose key lies in the closed byte interval `[start, end]`.
    /// This scans the whole map; iteration order is unspecified.
    pub fn get_range(&self, start: &[u8], end: &[u8]) -> HashMap<Vec<u8>, Location> {
        self.map
            .iter()
            .filter(|(key, _)| start <= key.as_slice() && key.as_slice() <= end)
            .map(|(key, location)| (key.clone(), *location))
            .collect()
    }

    /// number of live keys
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// whether the index holds no keys
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// total bytes of data file records still referenced by the index
    pub fn live_bytes(&self) -> u64 {
        self.map.values().map(|location| location.len).sum()
    }

    /// iterate over every `(key, location)` pair
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Location)> {
        self.map.iter()
    }

    /// replace the whole mapping; used by compaction after the file swap
    pub fn replace(&mut self, map: HashMap<Vec<u8>, Location>) {
        self.map = map;
    }

    /// clone the current mapping; used by compaction's snapshot phase
    pub fn snapshot(&self) -> HashMap<Vec<u8>, Location> {
        self.map.clone()
    }

    /// write a complete snapshot atomically: temp file, fsync, rename
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            let mut buf = Vec::new();
            buf.extend_from_slice(&(self.map.len() as u64).to_be_bytes());
            for (key, location) in &self.map {
                buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(&location.offset.to_be_bytes());
                buf.extend_from_slice(&location.len.to_be_bytes());
            }
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(entries = self.map.len(), "saved index snapshot");
        Ok(())
    }

    /// load the snapshot if present; a missing or malformed file starts empty
    pub fn load(&mut self) -> Result<()> {
        self.map.clear();
        if !self.path.exists() {
            return Ok(());
        }

        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;
        match parse_snapshot(&raw) {
            Some(map) => {
                debug!(entries = map.len(), "loaded index snapshot");
                self.map = map;
            }
            None => {
                warn!(path = ?self.path, "malformed index snapshot, starting empty");
            }
        }
        Ok(())
    }
}

/// parse a snapshot buffer; `None` if it is malformed anywhere
fn parse_snapshot(raw: &[u8]) -> Option<HashMap<Vec<u8>, Location>> {
    if raw.len() < 8 {
        return None;
    }
    let count = u64::from_be_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ]);
    let mut rest = &raw[8..];
    let mut map = HashMap::with_capacity(count as usize);

    for _ in 0..count {
        if rest.len() < 4 {
            return None;
        }
        let key_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < key_len + 16 {
            return None;
        }
        let key = rest[..key_len].to_vec();
        rest = &rest[key_len..];
        let offset = u64::from_be_bytes([
            rest[0], rest[1], rest[2], rest[3], rest[4], rest[5], rest[6], rest[7],
        ]);
        let len = u64::from_be_bytes([
            rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14], rest[15],
        ]);
        rest = &rest[16..];
        map.insert(key, Location { offset, len });
    }

    if !rest.is_empty() {
        return None;
    }
    Some(map)
}
