/// A worker pool that blocking jobs can be pushed onto.
///
/// The loop itself never blocks; anything that would (DNS resolution, file
/// reads, CPU-heavy work) goes through
/// [`run_in_executor`](super::LoopHandle::run_in_executor), which hands the
/// job to an `Executor` and completes a deferred back on the loop thread.
pub trait Executor {
    /// Run `job` on some worker thread, eventually.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        self.spawn(job);
    }
}

/// Build the default worker pool used when a client is not handed one.
pub(crate) fn default_pool() -> crate::Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .thread_name(|i| format!("gyre-worker-{i}"))
        .build()
        .map_err(crate::Error::runtime)
}
