//! The write-ahead log.
//!
//! Every mutation is encoded into a length-prefixed binary frame and fsynced
//! before the data file or index are touched. On restart the log is replayed
//! in order to reconstruct whatever the process did not get to apply.
//!
//! Frame layout: `total_len:u32 BE` followed by `total_len` payload bytes.
//! Payload: `op:u8 | key_len:u32 BE | key` for a delete, with
//! `value_len:u32 BE | value` appended for a put. Length-prefixed framing
//! keeps arbitrary binary keys and values byte-exact without any escaping.
//!
//! The WAL holds no lock of its own; the store serializes access through its
//! dedicated WAL mutex.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// A single logged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    /// a key was written with the given value
    Put {
        /// the key
        key: Vec<u8>,
        /// the value
        value: Vec<u8>,
    },
    /// a key was removed
    Delete {
        /// the key
        key: Vec<u8>,
    },
}

impl WalEntry {
    /// encode this entry into its length-prefixed frame
    fn encode(&self) -> Vec<u8> {
        let payload = match self {
            WalEntry::Put { key, value } => {
                let mut buf = Vec::with_capacity(9 + key.len() + value.len());
                buf.push(OP_PUT);
                buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
                buf.extend_from_slice(value);
                buf
            }
            WalEntry::Delete { key } => {
                let mut buf = Vec::with_capacity(5 + key.len());
                buf.push(OP_DELETE);
                buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
                buf.extend_from_slice(key);
                buf
            }
        };

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// decode one payload; `None` if it is malformed
    fn decode(payload: &[u8]) -> Option<WalEntry> {
        let (&op, rest) = payload.split_first()?;
        let (key, rest) = take_prefixed(rest)?;
        match op {
            OP_PUT => {
                let (value, rest) = take_prefixed(rest)?;
                if !rest.is_empty() {
                    return None;
                }
                Some(WalEntry::Put {
                    key: key.to_vec(),
                    value: value.to_vec(),
                })
            }
            OP_DELETE => {
                if !rest.is_empty() {
                    return None;
                }
                Some(WalEntry::Delete { key: key.to_vec() })
            }
            _ => None,
        }
    }
}

/// split a `u32 BE` length-prefixed chunk off the front of `buf`
fn take_prefixed(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

/// The durable, append-only mutation log.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    size: u64,
}

impl Wal {
    /// open (creating if absent) the WAL at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Wal> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        debug!(path = ?path, size, "opened WAL");
        Ok(Wal { path, file, size })
    }

    /// append one entry and fsync. Once this returns, a power loss will
    /// replay the entry on the next startup.
    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        let frame = entry.encode();
        self.file.write_all(&frame)?;
        self.file.sync_all()?;
        self.size += frame.len() as u64;
        Ok(())
    }

    /// read every entry from the start of the log, in order.
    ///
    /// A torn trailing entry (partial frame or malformed payload) ends the
    /// replay silently; everything before it is returned.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        let mut raw = Vec::new();
        let mut file = File::open(&self.path)?;
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut rest: &[u8] = &raw;
        while !rest.is_empty() {
            match take_prefixed(rest).and_then(|(payload, after)| {
                WalEntry::decode(payload).map(|entry| (entry, after))
            }) {
                Some((entry, after)) => {
                    entries.push(entry);
                    rest = after;
                }
                None => {
                    warn!(
                        trailing_bytes = rest.len(),
                        "discarding torn entry at WAL tail"
                    );
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// atomically empty the log
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.size = 0;
        Ok(())
    }

    /// current log size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// flush and drop the handle
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
