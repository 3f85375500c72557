//! Worker pool executing receive and send work off the loop thread.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of named worker threads fed from one unbounded queue.
///
/// No ordering is guaranteed between submitted jobs; per-connection
/// ordering comes from the server dispatching at most one job per
/// connection at a time.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `threads == 0` uses the number of online CPUs.
    pub fn new(threads: usize, name_prefix: &str) -> Self {
        let threads = if threads == 0 { num_cpus() } else { threads };
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-{worker_id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(worker_id, "worker exiting");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool {
            tx: Some(tx),
            handles,
        }
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Hand a job to the pool. Jobs submitted after shutdown are dropped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stop accepting jobs, let queued jobs drain, and join the threads.
    pub fn shutdown(&mut self) {
        // Dropping the sender closes the queue once it drains.
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn executes_submitted_jobs() {
        let pool = WorkerPool::new(4, "test-worker");
        assert_eq!(pool.threads(), 4);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let mut pool = WorkerPool::new(1, "drain-worker");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn zero_threads_defaults_to_cpu_count() {
        let pool = WorkerPool::new(0, "auto-worker");
        assert!(pool.threads() >= 1);
    }
}
