//! Serial execution lanes for handler delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded execution lane.
///
/// Every handler is bound to a context at registration time; deliveries to
/// it run serially, in arrival order, on the lane's task. The bus itself
/// may be driven from any thread — contexts are where that concurrency
/// collapses back to per-handler serial execution.
#[derive(Debug)]
pub(crate) struct Context {
    tx: mpsc::UnboundedSender<Job>,
}

impl Context {
    /// Create a context whose lane runs on the given runtime.
    pub(crate) fn new(handle: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                // A panicking job must not take the lane down with it.
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("job panicked on event bus context");
                }
            }
        });
        Self { tx }
    }

    /// Queue a job onto the lane. Jobs run in the order they were queued.
    ///
    /// Silently ignored once the lane has shut down (the bus is closing).
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let context = Context::new(&tokio::runtime::Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            context.execute(move || seen.lock().unwrap().push(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_the_lane() {
        let context = Context::new(&tokio::runtime::Handle::current());
        let seen = Arc::new(Mutex::new(false));
        context.execute(|| panic!("boom"));
        let seen2 = seen.clone();
        context.execute(move || *seen2.lock().unwrap() = true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(*seen.lock().unwrap());
    }
}
