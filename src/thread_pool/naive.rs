use super::ThreadPool;
use crate::Result;
use std::thread;
use tracing::trace;

/// The simplest possible "pool": no pool at all. Every connection gets a
/// brand new OS thread, created on demand and discarded when the handler
/// returns. Wasteful under load, but a useful baseline when comparing the
/// real pools, and selectable via `repkv-server --pool naive`.
pub struct NaiveThreadPool;

impl ThreadPool for NaiveThreadPool {
    /// the thread count is meaningless here; threads are created per job
    fn new(_threads: u32) -> Result<Self> {
        Ok(NaiveThreadPool)
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("spawning a dedicated thread for one connection");
        thread::spawn(job);
    }
}
