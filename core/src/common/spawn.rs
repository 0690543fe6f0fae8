//! Detached work.
//!
//! Handlers never run fork processing or sync kicks inline; they hand a job to
//! a [`Spawner`]. The node uses tokio's blocking pool, the test kit queues jobs
//! and runs them when the in-process network is pumped.

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Spawner: Send + Sync {
    fn spawn(&self, name: &'static str, job: Job);
}

/// Runs jobs on tokio's blocking thread pool.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, name: &'static str, job: Job) {
        log::trace!("[spawn] {}", name);
        self.handle.spawn_blocking(job);
    }
}
