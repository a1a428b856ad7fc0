use crossbeam_channel::{Sender, unbounded};
use tracing::{trace, warn};

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of dispatch threads.
///
/// Jobs are pushed onto a shared channel and picked up by whichever
/// worker is idle. A panicking job is logged and does not take its
/// worker down.
pub(crate) struct WorkerPool {
    /// Sending half of the job queue; dropped on shutdown.
    sender: Option<Sender<Job>>,

    /// Join handles for worker threads.
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers named `{name}-{id}`.
    pub(crate) fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let receiver = receiver.clone();

            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    for job in receiver.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!(worker = id, "dispatch job panicked");
                        }
                    }
                    trace!(worker = id, "dispatch worker exiting");
                });

            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(?err, "failed to spawn dispatch worker"),
            }
        }

        Self {
            sender: Some(sender),
            handles,
        }
    }

    /// Number of live worker threads.
    pub(crate) fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queues a job, running it inline if the pool has no workers.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.sender {
            Some(sender) if !self.handles.is_empty() => {
                if let Err(rejected) = sender.send(Box::new(job)) {
                    (rejected.into_inner())();
                }
            }
            _ => job(),
        }
    }

    /// Stops accepting jobs and joins every worker.
    ///
    /// Jobs already queued still run.
    pub(crate) fn shutdown(&mut self) {
        self.sender.take();

        let current = thread::current().id();
        for h in self.handles.drain(..) {
            if h.thread().id() != current {
                let _ = h.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 4);
        assert_eq!(pool.size(), 4);

        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn survives_panicking_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 1);

        pool.execute(|| panic!("boom"));
        let c = counter.clone();
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_pool_runs_inline() {
        let pool = WorkerPool::new("test", 0);
        let counter = AtomicUsize::new(0);
        let c = Arc::new(counter);
        let c2 = c.clone();
        pool.execute(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }
}
