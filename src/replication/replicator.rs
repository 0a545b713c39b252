//! The replication pipeline.
//!
//! The master's store hands every committed mutation to the [`Replicator`].
//! In async mode the operation lands on a bounded queue and a small worker
//! pool forwards it; a full queue drops the operation (the master's local
//! state is already durable, so the client is not told). In sync mode the
//! mutating thread forwards the operation itself and the put/delete only
//! succeeds if every currently-healthy replica acknowledges `OK`.
//!
//! Each forward is one short-lived TCP connection carrying a single
//! `REPLICATE *` command in the ordinary wire protocol.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::replica::{ReplicaNode, ReplicaSet};
use crate::config::{ReplicationConfig, ReplicationMode};
use crate::error::{KvError, Result};
use crate::protocol;

/// number of worker threads draining the async queue
const NUM_WORKERS: usize = 2;
/// how long a worker blocks on the queue before re-checking the running flag
const WORKER_POLL: Duration = Duration::from_millis(200);

/// A mutation to forward to the replicas.
#[derive(Debug, Clone)]
pub enum ReplicationOp {
    /// forward one put
    Put {
        /// the key
        key: Vec<u8>,
        /// the value
        value: Vec<u8>,
    },
    /// forward one batch put
    BatchPut {
        /// the keys
        keys: Vec<Vec<u8>>,
        /// the values, one per key
        values: Vec<Vec<u8>>,
    },
    /// forward one delete
    Delete {
        /// the key
        key: Vec<u8>,
    },
}

impl ReplicationOp {
    /// render this operation as a `REPLICATE *` command line
    fn encode(&self) -> Vec<u8> {
        match self {
            ReplicationOp::Put { key, value } => {
                protocol::encode_replicate(&protocol::encode_put(key, value))
            }
            ReplicationOp::BatchPut { keys, values } => {
                protocol::encode_replicate(&protocol::encode_batch_put(keys, values))
            }
            ReplicationOp::Delete { key } => {
                protocol::encode_replicate(&protocol::encode_delete(key))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReplicationOp::Put { .. } => "put",
            ReplicationOp::BatchPut { .. } => "batch_put",
            ReplicationOp::Delete { .. } => "delete",
        }
    }
}

/// an operation waiting on the async queue, with its retry budget
struct QueuedOp {
    op: ReplicationOp,
    attempts: u32,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// A point-in-time snapshot of replication counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationStats {
    /// mutations handed to the replicator
    pub total: u64,
    /// rounds where at least one replica (async) or every healthy replica
    /// (sync) acknowledged
    pub succeeded: u64,
    /// rounds where no replica acknowledged
    pub failed: u64,
    /// operations dropped because the queue was full
    pub dropped: u64,
    /// operations currently waiting on the queue
    pub queue_len: usize,
}

struct ReplicatorInner {
    replicas: ReplicaSet,
    mode: ReplicationMode,
    max_retries: u32,
    timeout: Duration,
    tx: Sender<QueuedOp>,
    rx: Receiver<QueuedOp>,
    running: AtomicBool,
    counters: Counters,
}

/// Queue and worker pool forwarding the master's mutations to its replicas.
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    /// build a replicator from the replication section of the config and, in
    /// async mode, start its worker threads
    pub fn new(config: &ReplicationConfig) -> Result<Replicator> {
        let (tx, rx) = channel::bounded(config.queue_size);
        let inner = Arc::new(ReplicatorInner {
            replicas: ReplicaSet::new(config.addresses.clone(), config.max_failures),
            mode: config.mode,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            tx,
            rx,
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let mut workers = Vec::new();
        if config.mode == ReplicationMode::Async {
            for id in 0..NUM_WORKERS {
                let inner = Arc::clone(&inner);
                workers.push(
                    thread::Builder::new()
                        .name(format!("replication-worker-{}", id))
                        .spawn(move || worker_loop(inner))?,
                );
            }
        }
        info!(
            mode = ?config.mode,
            replicas = inner.replicas.len(),
            workers = workers.len(),
            "replicator started"
        );

        Ok(Replicator {
            inner,
            workers: parking_lot::Mutex::new(workers),
        })
    }

    /// forward a put
    pub fn replicate_put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.submit(ReplicationOp::Put { key, value })
    }

    /// forward a batch put
    pub fn replicate_batch_put(&self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<()> {
        self.submit(ReplicationOp::BatchPut { keys, values })
    }

    /// forward a delete
    pub fn replicate_delete(&self, key: Vec<u8>) -> Result<()> {
        self.submit(ReplicationOp::Delete { key })
    }

    /// route one operation according to the configured mode.
    ///
    /// Async mode never fails the caller: a full queue drops the operation
    /// and only bumps a counter. Sync mode propagates a failure from any
    /// healthy replica.
    fn submit(&self, op: ReplicationOp) -> Result<()> {
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);
        match self.inner.mode {
            ReplicationMode::Sync => self.inner.replicate_now(&op),
            ReplicationMode::Async => {
                match self.inner.tx.try_send(QueuedOp { op, attempts: 0 }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(queued)) => {
                        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(op = queued.op.kind(), "replication queue full, dropping operation");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
                Ok(())
            }
        }
    }

    /// snapshot of the replication counters
    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            total: self.inner.counters.total.load(Ordering::Relaxed),
            succeeded: self.inner.counters.succeeded.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            queue_len: self.inner.rx.len(),
        }
    }

    /// per-replica health descriptors
    pub fn replica_status(&self) -> Vec<ReplicaNode> {
        self.inner.replicas.status()
    }

    /// operator-driven reset of all replica health state
    pub fn reset_health(&self) {
        self.inner.replicas.reset_health();
    }

    /// stop the worker pool; pending queued operations are abandoned
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        info!("replicator stopped");
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ReplicatorInner {
    /// sync-mode round: success iff every currently-healthy replica acks.
    /// With no healthy replicas there is nothing to wait for and the round
    /// succeeds vacuously.
    fn replicate_now(&self, op: &ReplicationOp) -> Result<()> {
        let addrs = self.replicas.healthy_addrs();
        let mut failures = Vec::new();
        for addr in addrs {
            match send_to_replica(&addr, op, self.timeout) {
                Ok(()) => self.replicas.mark_success(&addr),
                Err(err) => {
                    self.replicas.mark_failure(&addr);
                    failures.push(format!("{}: {}", addr, err));
                }
            }
        }
        if failures.is_empty() {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            Err(KvError::Replication(failures.join("; ")))
        }
    }

    /// async-mode round: the op is considered delivered if at least one
    /// healthy replica acked; a fully-failed round is re-queued until its
    /// retry budget runs out
    fn process(&self, queued: QueuedOp) {
        let addrs = self.replicas.healthy_addrs();
        if addrs.is_empty() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut successes = 0_usize;
        for addr in &addrs {
            match send_to_replica(addr, &queued.op, self.timeout) {
                Ok(()) => {
                    self.replicas.mark_success(addr);
                    successes += 1;
                }
                Err(err) => {
                    debug!(addr = addr.as_str(), error = %err, "replication attempt failed");
                    self.replicas.mark_failure(addr);
                }
            }
        }

        if successes > 0 {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            if queued.attempts < self.max_retries {
                let retry = QueuedOp {
                    op: queued.op,
                    attempts: queued.attempts + 1,
                };
                // a full queue here means newer operations win; give up
                let _ = self.tx.try_send(retry);
            }
        }
    }
}

/// worker thread body: drain the queue until the replicator stops
fn worker_loop(inner: Arc<ReplicatorInner>) {
    while inner.running.load(Ordering::SeqCst) {
        match inner.rx.recv_timeout(WORKER_POLL) {
            Ok(queued) => inner.process(queued),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("replication worker exited");
}

/// open a short-lived connection, send one `REPLICATE *` command, and expect
/// an `OK` line back within the timeout
fn send_to_replica(addr: &str, op: &ReplicationOp, timeout: Duration) -> Result<()> {
    let sock_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| KvError::Replication(format!("could not resolve {}", addr)))?;

    let mut stream = TcpStream::connect_timeout(&sock_addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(&op.encode())?;
    stream.flush()?;

    let mut response = Vec::new();
    BufReader::new(&stream).read_until(b'\n', &mut response)?;
    while response.last() == Some(&b'\n') || response.last() == Some(&b'\r') {
        response.pop();
    }

    if response == protocol::RESP_OK {
        Ok(())
    } else {
        Err(KvError::Replication(format!(
            "replica {} answered {:?}",
            addr,
            String::from_utf8_lossy(&response)
        )))
    }
}
