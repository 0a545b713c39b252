//! Store configuration.
//!
//! All knobs live in one immutable [`Config`] value that is passed into
//! [`Store::open`] and [`Server::new`] at construction time. Fields can be
//! loaded from a JSON file (every field has a default) or set through the
//! builder.
//!
//! [`Store::open`]: ../store/struct.Store.html#method.open
//! [`Server::new`]: ../server/struct.Server.html#method.new

use serde::Deserialize;
use std::path::PathBuf;

/// name of the write-ahead log file inside the data directory
pub const WAL_FILENAME: &str = "wal.log";
/// name of the append-only data file inside the data directory
pub const DATA_FILENAME: &str = "data.db";
/// name of the index snapshot file inside the data directory
pub const INDEX_FILENAME: &str = "index.db";

/// Configuration for a store instance
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// directory holding the WAL, data file, and index snapshot
    pub data_dir: PathBuf,

    /// the IP address and port the server listens on
    pub listen_addr: String,

    /// seconds between index snapshots taken by the checkpoint worker
    pub checkpoint_interval_secs: u64,

    /// advisory WAL size limit in bytes; exceeding it only produces a warning
    pub max_wal_size: u64,

    /// compaction knobs
    pub compaction: CompactionConfig,

    /// replication knobs
    pub replication: ReplicationConfig,
}

/// Knobs controlling the background compactor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// whether the background compaction worker runs at all
    pub enabled: bool,

    /// seconds between compaction checks
    pub interval_secs: u64,

    /// minimum dead-space ratio (0.0 - 1.0) before a compaction pass runs
    pub threshold: f64,

    /// data files smaller than this many bytes are never compacted
    pub min_file_size: u64,
}

/// Knobs controlling replication from a master to its replicas
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// whether this master forwards mutations to replicas
    pub enabled: bool,

    /// async (queued) or sync (caller-driven) replication
    pub mode: ReplicationMode,

    /// replica addresses in `host:port` form
    pub addresses: Vec<String>,

    /// times a failed async round is re-queued before it is abandoned
    pub max_retries: u32,

    /// capacity of the async replication queue
    pub queue_size: usize,

    /// consecutive failures before a replica is marked unhealthy
    pub max_failures: u32,

    /// per-attempt connect/read/write timeout in seconds
    pub timeout_secs: u64,
}

/// Whether replication happens on a worker pool or on the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// mutations are queued and forwarded by background workers
    Async,
    /// the mutating thread forwards to every healthy replica before returning
    Sync,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./repkv_data"),
            listen_addr: "127.0.0.1:4000".to_string(),
            checkpoint_interval_secs: 10,
            max_wal_size: 100 * 1024 * 1024,
            compaction: CompactionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            enabled: true,
            interval_secs: 3600,
            threshold: 0.3,
            min_file_size: 10 * 1024 * 1024,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            enabled: false,
            mode: ReplicationMode::Async,
            addresses: Vec::new(),
            max_retries: 3,
            queue_size: 10_000,
            max_failures: 3,
            timeout_secs: 5,
        }
    }
}

impl Config {
    /// create a builder starting from the default configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// parse a `Config` from a JSON string; omitted fields take their defaults
    pub fn from_json(json: &str) -> crate::Result<Config> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for [`Config`]
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// set the data directory
    pub fn data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// set the listen address
    pub fn listen_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// set the checkpoint interval in seconds
    pub fn checkpoint_interval_secs(mut self, secs: u64) -> Self {
        self.config.checkpoint_interval_secs = secs;
        self
    }

    /// set the advisory WAL size limit
    pub fn max_wal_size(mut self, bytes: u64) -> Self {
        self.config.max_wal_size = bytes;
        self
    }

    /// enable or disable the background compaction worker
    pub fn compaction_enabled(mut self, enabled: bool) -> Self {
        self.config.compaction.enabled = enabled;
        self
    }

    /// set the compaction check interval in seconds
    pub fn compaction_interval_secs(mut self, secs: u64) -> Self {
        self.config.compaction.interval_secs = secs;
        self
    }

    /// set the dead-space ratio that triggers compaction
    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.config.compaction.threshold = threshold;
        self
    }

    /// set the minimum data file size eligible for compaction
    pub fn compaction_min_file_size(mut self, bytes: u64) -> Self {
        self.config.compaction.min_file_size = bytes;
        self
    }

    /// enable replication to the given `host:port` addresses
    pub fn replicas<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.replication.addresses = addrs.into_iter().map(Into::into).collect();
        self.config.replication.enabled = !self.config.replication.addresses.is_empty();
        self
    }

    /// set the replication mode
    pub fn replication_mode(mut self, mode: ReplicationMode) -> Self {
        self.config.replication.mode = mode;
        self
    }

    /// set the replication retry budget
    pub fn replication_max_retries(mut self, retries: u32) -> Self {
        self.config.replication.max_retries = retries;
        self
    }

    /// set the async replication queue capacity
    pub fn replication_queue_size(mut self, size: usize) -> Self {
        self.config.replication.queue_size = size;
        self
    }

    /// set the consecutive-failure count that flips a replica unhealthy
    pub fn replication_max_failures(mut self, failures: u32) -> Self {
        self.config.replication.max_failures = failures;
        self
    }

    /// set the per-attempt replication timeout in seconds
    pub fn replication_timeout_secs(mut self, secs: u64) -> Self {
        self.config.replication.timeout_secs = secs;
        self
    }

    /// finish the builder
    pub fn build(self) -> Config {
        self.config
    }
}
