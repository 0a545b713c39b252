//! The storage engine: an append-only data file indexed by an in-memory hash
//! map, fronted by a write-ahead log, with background checkpointing and
//! compaction and an optional replication pipeline.
//!
//! A mutation on the master moves through three phases: it is fsynced into
//! the WAL under the WAL mutex, applied to the data file and index under the
//! write half of the data lock, and finally handed to the replicator. Reads
//! touch only the index and data file under the read half of the data lock,
//! so they never contend with WAL appends.
//!
//! Because the WAL mutex and the write lock are taken in separate phases, two
//! concurrent puts may land in the WAL in one order and in the data file in
//! the other. Recovery replays the WAL, so the WAL order is the one that
//! survives a crash.

pub mod lock;

mod compaction;
mod data_file;
mod index;
mod wal;

pub use self::data_file::DataFile;
pub use self::index::{Index, Location};
pub use self::wal::{Wal, WalEntry};

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, DATA_FILENAME, INDEX_FILENAME, WAL_FILENAME};
use crate::error::{KvError, Result};
use crate::replication::Replicator;

/// Whether a store instance is the cluster's single writable node or a
/// read-only follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// the single writable node; owns the replicator and the compactor
    Master,
    /// a read-only follower fed through the replication protocol; runs no
    /// replicator and no compactor
    Replica,
}

/// the data file and index, guarded together by the data lock
pub(crate) struct Core {
    pub(crate) data_file: DataFile,
    pub(crate) index: Index,
}

pub(crate) struct StoreInner {
    pub(crate) config: Config,
    role: Role,
    wal: Mutex<Wal>,
    pub(crate) core: lock::RwLock<Core>,
    replicator: Option<Replicator>,
    // serializes compaction passes; the worker and a manual compact() must
    // never interleave their temp-file phases
    pub(crate) compaction_lock: Mutex<()>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The durable key-value store.
///
/// Cheap to clone; all clones share one engine. Any number of threads may
/// call any operation concurrently -- the data lock and WAL mutex serialize
/// what must be serialized.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Store {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Store {
    /// open (creating the data directory if needed) a store, run crash
    /// recovery, and start the background workers.
    ///
    /// Recovery replays whatever the WAL holds before the store serves a
    /// single request; if the replay fails midway the WAL is left untouched
    /// and the error is returned, so a restart can repeat it.
    #[instrument(skip(config))]
    pub fn open(config: Config, role: Role) -> Result<Store> {
        fs::create_dir_all(&config.data_dir)?;
        info!(data_dir = ?config.data_dir, ?role, "opening store");

        let mut wal = Wal::open(config.data_dir.join(WAL_FILENAME))?;
        let mut data_file = DataFile::open(config.data_dir.join(DATA_FILENAME))?;
        let mut index = Index::open(config.data_dir.join(INDEX_FILENAME))?;
        recover(&mut wal, &mut data_file, &mut index)?;

        let replicator = if role == Role::Master && config.replication.enabled {
            Some(Replicator::new(&config.replication)?)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = channel::unbounded::<()>();
        let inner = Arc::new(StoreInner {
            config,
            role,
            wal: Mutex::new(wal),
            core: lock::RwLock::new(Core { data_file, index }),
            replicator,
            compaction_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::new();
        {
            let weak = Arc::downgrade(&inner);
            let shutdown = shutdown_rx.clone();
            let interval = Duration::from_secs(inner.config.checkpoint_interval_secs);
            workers.push(
                thread::Builder::new()
                    .name("checkpoint".to_string())
                    .spawn(move || checkpoint_loop(weak, shutdown, interval))?,
            );
        }
        if role == Role::Master && inner.config.compaction.enabled {
            let weak = Arc::downgrade(&inner);
            let interval = Duration::from_secs(inner.config.compaction.interval_secs);
            workers.push(
                thread::Builder::new()
                    .name("compaction".to_string())
                    .spawn(move || compaction_loop(weak, shutdown_rx, interval))?,
            );
        }
        *inner.workers.lock() = workers;

        Ok(Store { inner })
    }

    /// store one key/value pair.
    ///
    /// An error after the WAL append means the mutation is durable but may
    /// not yet be applied; it will replay on the next startup.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        {
            let mut wal = self.inner.wal.lock();
            wal.log(&WalEntry::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            })?;
        }
        {
            let mut core = self.inner.core.write();
            let (offset, len) = core.data_file.append(key, value)?;
            core.index.put(key.to_vec(), Location { offset, len });
        }
        if let Some(replicator) = &self.inner.replicator {
            replicator.replicate_put(key.to_vec(), value.to_vec())?;
        }
        Ok(())
    }

    /// store several pairs, holding the WAL mutex once and the write lock
    /// once for the whole batch. The batch either fully succeeds or the
    /// error is surfaced; partial progress is repaired by WAL replay.
    pub fn batch_put(&self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> Result<()> {
        if keys.len() != values.len() {
            return Err(KvError::Parsing(
                "keys and values must have the same length".to_string(),
            ));
        }
        if keys.is_empty() {
            return Ok(());
        }
        {
            let mut wal = self.inner.wal.lock();
            for (key, value) in keys.iter().zip(values) {
                wal.log(&WalEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                })?;
            }
        }
        {
            let mut core = self.inner.core.write();
            for (key, value) in keys.iter().zip(values) {
                let (offset, len) = core.data_file.append(key, value)?;
                core.index.put(key.clone(), Location { offset, len });
            }
        }
        if let Some(replicator) = &self.inner.replicator {
            replicator.replicate_batch_put(keys.to_vec(), values.to_vec())?;
        }
        Ok(())
    }

    /// fetch the value for `key`, or `None` if it is absent.
    ///
    /// The record read back from the data file must carry the same key the
    /// index claimed; a mismatch is reported as corruption.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let core = self.inner.core.read();
        let location = match core.index.get(key) {
            Some(location) => location,
            None => return Ok(None),
        };
        let (stored_key, value) = core.data_file.read(location.offset)?;
        if stored_key != key {
            error!(offset = location.offset, "index and data file disagree on the stored key");
            return Err(KvError::Corruption(format!(
                "record at offset {} does not hold the indexed key",
                location.offset
            )));
        }
        Ok(Some(value))
    }

    /// fetch every live pair whose key lies in the closed byte interval
    /// `[start, end]`. The index is scanned in full; the result's iteration
    /// order is unspecified.
    pub fn read_range(&self, start: &[u8], end: &[u8]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let core = self.inner.core.read();
        let mut result = HashMap::new();
        for (key, location) in core.index.get_range(start, end) {
            let (stored_key, value) = core.data_file.read(location.offset)?;
            if stored_key != key {
                error!(offset = location.offset, "index and data file disagree on the stored key");
                return Err(KvError::Corruption(format!(
                    "record at offset {} does not hold the indexed key",
                    location.offset
                )));
            }
            result.insert(key, value);
        }
        Ok(result)
    }

    /// remove `key`. Returns `false` if the key was absent.
    ///
    /// Three phases: existence check under the read lock, WAL append under
    /// the WAL mutex, then removal under the write lock. The second
    /// existence check under the write lock is mandatory -- another deleter
    /// may have removed the key between the phases, and exactly one caller
    /// must win.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        {
            let core = self.inner.core.read();
            if core.index.get(key).is_none() {
                return Ok(false);
            }
        }
        {
            let mut wal = self.inner.wal.lock();
            wal.log(&WalEntry::Delete { key: key.to_vec() })?;
        }
        {
            let mut core = self.inner.core.write();
            if core.index.get(key).is_none() {
                // lost the race; the winner already logged and replicated
                return Ok(false);
            }
            core.index.delete(key);
        }
        if let Some(replicator) = &self.inner.replicator {
            replicator.replicate_delete(key.to_vec())?;
        }
        Ok(true)
    }

    /// run one compaction pass now, regardless of the worker's schedule.
    /// Master only; a replica returns an error.
    pub fn compact(&self) -> Result<()> {
        if self.inner.role == Role::Replica {
            return Err(KvError::StringErr(
                "compaction is disabled on replicas".to_string(),
            ));
        }
        compaction::compact(&self.inner)
    }

    /// whether the data file currently meets the size and dead-space
    /// thresholds for compaction
    pub fn should_compact(&self) -> bool {
        compaction::should_compact(&self.inner)
    }

    /// this store's role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// the replicator, when this store is a master with replication enabled
    pub fn replicator(&self) -> Option<&Replicator> {
        self.inner.replicator.as_ref()
    }

    /// current size of the data file in bytes
    pub fn data_file_size(&self) -> u64 {
        self.inner.core.read().data_file.size()
    }

    /// number of live keys
    pub fn key_count(&self) -> usize {
        self.inner.core.read().index.len()
    }

    /// current size of the WAL in bytes
    pub fn wal_size(&self) -> u64 {
        self.inner.wal.lock().size()
    }

    /// the directory this store persists into
    pub fn data_dir(&self) -> PathBuf {
        self.inner.config.data_dir.clone()
    }

    /// graceful shutdown: stop the background workers, stop the replicator,
    /// and persist a final index snapshot. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing store");

        // dropping the sender disconnects the shutdown channel, which wakes
        // every worker out of its sleep immediately
        self.inner.shutdown_tx.lock().take();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        if let Some(replicator) = &self.inner.replicator {
            replicator.stop();
        }

        let core = self.inner.core.read();
        core.index.save()?;
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // close() was never called; tell any straggling worker to stop and
        // take a best-effort final snapshot. Workers hold only weak
        // references, so they cannot keep this alive or be joined here.
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown_tx.lock().take();
            let _ = self.core.read().index.save();
        }
    }
}

/// replay the WAL into the data file and index, then snapshot and truncate.
///
/// Later entries override earlier ones and deletes drop keys, so after the
/// replay the index reflects exactly the set of keys surviving the log.
fn recover(wal: &mut Wal, data_file: &mut DataFile, index: &mut Index) -> Result<()> {
    let entries = wal.replay()?;
    if entries.is_empty() {
        return Ok(());
    }
    info!(entries = entries.len(), "recovering from WAL");

    for entry in entries {
        match entry {
            WalEntry::Put { key, value } => {
                let (offset, len) = data_file.append(&key, &value)?;
                index.put(key, Location { offset, len });
            }
            WalEntry::Delete { key } => {
                index.delete(&key);
            }
        }
    }

    index.save()?;
    wal.truncate()?;
    Ok(())
}

/// background worker: periodically snapshot the index under the read lock.
/// The WAL is deliberately left alone; replay stays cheap because recovery
/// truncates it, and truncating here would need a snapshot-covers-log proof.
fn checkpoint_loop(inner: Weak<StoreInner>, shutdown: Receiver<()>, interval: Duration) {
    debug!("checkpoint worker started");
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        if let Err(err) = inner.core.read().index.save() {
            error!(error = %err, "checkpoint failed");
        }

        let wal_size = inner.wal.lock().size();
        if wal_size > inner.config.max_wal_size {
            warn!(
                wal_size,
                limit = inner.config.max_wal_size,
                "WAL exceeds its advisory size limit"
            );
        }
    }
    debug!("checkpoint worker exited");
}

/// background worker: compact the data file when it crosses the thresholds
fn compaction_loop(inner: Weak<StoreInner>, shutdown: Receiver<()>, interval: Duration) {
    debug!("compaction worker started");
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        if compaction::should_compact(&inner) {
            if let Err(err) = compaction::compact(&inner) {
                error!(error = %err, "compaction failed");
            }
        }
    }
    debug!("compaction worker exited");
}
