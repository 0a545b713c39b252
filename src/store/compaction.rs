//! Data file compaction.
//!
//! Overwrites and deletes leave dead records behind in the append-only data
//! file. Compaction rewrites every record the index still references into a
//! fresh file and atomically swaps it in, in four phases:
//!
//! 1. **snapshot** -- under the read lock, clone the index and note the file
//!    size; everything below that size is covered by the snapshot.
//! 2. **copy** -- re-acquire the read lock per record while copying the
//!    snapshot's records into a temp file, so readers are never blocked for
//!    longer than one record.
//! 3. **swap** -- under the write lock, copy any record appended since the
//!    snapshot (its offset is at or past the noted size), rename the live
//!    file to its backup name, rename the temp file into place, rebuild the
//!    index against the new offsets, and reopen the handle.
//! 4. **cleanup** -- keep one backup generation; a failed pass removes the
//!    temp file and leaves the live store untouched.
//!
//! Runs on the master only. A replica applies whatever the master streams to
//! it and has no authority to rewrite its own file underneath that stream.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::data_file::DataFile;
use super::index::Location;
use super::{Core, StoreInner};
use crate::config::{CompactionConfig, DATA_FILENAME};
use crate::error::{KvError, Result};

/// whether the data file currently crosses both compaction thresholds
pub(super) fn should_compact(inner: &StoreInner) -> bool {
    let core = inner.core.read();
    eligible(&core, &inner.config.compaction)
}

fn eligible(core: &Core, config: &CompactionConfig) -> bool {
    let size = core.data_file.size();
    if size == 0 || size < config.min_file_size {
        return false;
    }
    let live = core.index.live_bytes();
    let dead_ratio = 1.0 - live as f64 / size as f64;
    debug!(size, live, dead_ratio, "compaction check");
    dead_ratio >= config.threshold
}

/// run one full compaction pass
pub(super) fn compact(inner: &StoreInner) -> Result<()> {
    // one pass at a time; the worker and manual triggers share a temp path
    let _guard = inner.compaction_lock.lock();
    let data_path = inner.config.data_dir.join(DATA_FILENAME);
    let tmp_path = inner.config.data_dir.join(format!("{}.tmp", DATA_FILENAME));
    let backup_path = inner.config.data_dir.join(format!("{}.old", DATA_FILENAME));

    let result = run(inner, &data_path, &tmp_path, &backup_path);
    if result.is_err() {
        // a failed pass must leave nothing behind but the live store
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn run(inner: &StoreInner, data_path: &Path, tmp_path: &Path, backup_path: &Path) -> Result<()> {
    // phase 1: snapshot the index and the covered file size
    let (snapshot, size_at_snapshot) = {
        let core = inner.core.read();
        (core.index.snapshot(), core.data_file.size())
    };
    info!(
        keys = snapshot.len(),
        size_at_snapshot, "starting compaction"
    );

    // a leftover temp file from an interrupted pass must not be appended to
    if tmp_path.exists() {
        fs::remove_file(tmp_path)?;
    }
    let mut tmp = DataFile::open(tmp_path)?;

    // phase 2: copy the snapshot's records, re-taking the read lock per
    // record so readers interleave freely
    let mut copied: HashMap<Vec<u8>, Location> = HashMap::with_capacity(snapshot.len());
    for (key, location) in &snapshot {
        let (stored_key, value) = {
            let core = inner.core.read();
            core.data_file.read(location.offset)?
        };
        if &stored_key != key {
            return Err(KvError::Corruption(format!(
                "record at offset {} does not hold the indexed key",
                location.offset
            )));
        }
        let (offset, len) = tmp.append(&stored_key, &value)?;
        copied.insert(stored_key, Location { offset, len });
    }

    // phase 3: swap, exclusively
    let mut core = inner.core.write();

    // records that landed during the copy phase sit at or past the snapshot
    // size; bring them over now that no writer can race us
    let mut rebuilt: HashMap<Vec<u8>, Location> = HashMap::with_capacity(core.index.len());
    for (key, location) in core.index.iter() {
        if location.offset >= size_at_snapshot {
            let (stored_key, value) = core.data_file.read(location.offset)?;
            let (offset, len) = tmp.append(&stored_key, &value)?;
            rebuilt.insert(stored_key, Location { offset, len });
        } else if let Some(new_location) = copied.get(key) {
            rebuilt.insert(key.clone(), *new_location);
        } else {
            // a pre-snapshot offset not covered by the snapshot cannot
            // happen through the store's own write path
            return Err(KvError::Corruption(format!(
                "index entry at offset {} missing from compaction snapshot",
                location.offset
            )));
        }
    }

    tmp.close()?;
    fs::rename(data_path, backup_path)?;
    if let Err(err) = fs::rename(tmp_path, data_path) {
        // put the original back so the store stays usable
        let _ = fs::rename(backup_path, data_path);
        return Err(err.into());
    }

    core.data_file = DataFile::open(data_path)?;
    core.index.replace(rebuilt);
    // persist the rebuilt index while still exclusive: a crash between the
    // swap and the next checkpoint must not leave a snapshot full of offsets
    // into the pre-compaction file
    core.index.save()?;

    info!(
        new_size = core.data_file.size(),
        keys = core.index.len(),
        "compaction complete"
    );
    Ok(())
}
