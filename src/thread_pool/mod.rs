//! Thread pools used by the server to run per-connection handlers.
use crate::Result;

/// A pool of threads that jobs can be spawned onto.
pub trait ThreadPool {
    /// create a pool with the given number of `threads`
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// run `job` on one of the pool's threads
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod naive;
mod rayon_pool;
mod shared_queue;

pub use self::naive::NaiveThreadPool;
pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;
