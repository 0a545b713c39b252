use super::ThreadPool;
use crate::{KvError, Result};
use rayon;
use tracing::debug;

/// A thread pool that uses a work stealing strategy as implemented by the
/// [`Rayon`] library.
///
/// [`Rayon`]: https://docs.rs/rayon/latest/rayon/index.html
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .build()
            .map_err(|e| KvError::StringErr(format!("could not build thread pool: {:?}", &e)))?;
        debug!("created thread pool with {} threads", &threads);

        Ok(Self { pool })
    }

    /// hand the job to rayon's queue; unlike `install`, this never runs the
    /// job on the calling thread, so the server's acceptor loop cannot be
    /// captured by a connection handler
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::RayonThreadPool;
    use crate::thread_pool::ThreadPool;
    use crossbeam::channel;
    use std::time::Duration;

    #[test]
    fn every_spawned_job_runs() {
        let pool = RayonThreadPool::new(4).unwrap();
        let (tx, rx) = channel::unbounded();
        for i in 0..20 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap());
        }
        drop(tx);

        let mut got: Vec<i32> = rx.iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn spawn_does_not_run_jobs_on_the_calling_thread() {
        // occupy the pool's only worker with a job parked on a rendezvous
        // channel; queueing a second job must still return immediately
        let pool = RayonThreadPool::new(1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        pool.spawn(move || release_rx.recv().unwrap());

        let (done_tx, done_rx) = channel::bounded(1);
        pool.spawn(move || done_tx.send(()).unwrap());

        // unpark the worker; the queued job now runs and reports back
        release_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
