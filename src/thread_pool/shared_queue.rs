use super::ThreadPool;
use crate::Result;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, error, trace};

/// The default pool servicing client connections: a fixed set of workers
/// draining one shared crossbeam MPMC channel.
///
/// Every spawned job is tagged with a sequence number and every worker with a
/// stable id, so a connection handler's lifecycle can be followed in the logs
/// from dispatch to completion. A job that panics takes its worker thread
/// down with it; the worker's sentinel respawns a replacement under the same
/// id, so one misbehaving connection never shrinks the pool.
pub struct SharedQueueThreadPool {
    /// the producing half of the job channel
    tx: Sender<Job>,
    /// sequence number handed to the next spawned job
    next_job: AtomicU64,
}

/// one queued connection-handler closure, tagged for the logs
struct Job {
    id: u64,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl ThreadPool for SharedQueueThreadPool {
    /// create a pool of `threads` workers, all consuming the same job channel
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for worker in 0..threads {
            spawn_worker(worker, rx.clone())?;
        }
        Ok(SharedQueueThreadPool {
            tx,
            next_job: AtomicU64::new(0),
        })
    }

    /// Queue a job for the next free worker.
    ///
    /// # Panics
    ///
    /// Panics if every worker has died and could not be respawned.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Job {
                id,
                run: Box::new(job),
            })
            .expect("There are no threads in the pool");
    }
}

/// start worker `worker` on its own named thread
fn spawn_worker(worker: u32, rx: Receiver<Job>) -> Result<()> {
    let sentinel = WorkerSentinel {
        worker,
        rx: rx.clone(),
    };
    thread::Builder::new()
        .name(format!("conn-worker-{}", worker))
        .spawn(move || run_jobs(sentinel))?;
    Ok(())
}

/// Dropped when a worker's loop ends. If the drop happens because a job
/// panicked, a replacement worker is started under the same id.
struct WorkerSentinel {
    worker: u32,
    rx: Receiver<Job>,
}

impl Drop for WorkerSentinel {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!(worker = self.worker, "connection handler panicked, respawning worker");
            if let Err(e) = spawn_worker(self.worker, self.rx.clone()) {
                error!(worker = self.worker, "failed to respawn worker: {}", e);
            }
        }
    }
}

/// worker body: run queued jobs until the pool (the only sender) is dropped
fn run_jobs(sentinel: WorkerSentinel) {
    while let Ok(job) = sentinel.rx.recv() {
        trace!(worker = sentinel.worker, job = job.id, "running connection job");
        (job.run)();
        trace!(worker = sentinel.worker, job = job.id, "connection job finished");
    }
    debug!(worker = sentinel.worker, "pool destroyed, worker exiting");
}
