use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{trace, warn};

use crate::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads executing callback dispatches.
///
/// Jobs are executed in enqueue order (single FIFO channel); with more than
/// one worker, completions may still overlap. The pool starts stopped:
/// servers start it eagerly on `start()`, clients only while connected.
pub struct WorkerPool {
    workers: usize,
    inner: std::sync::Mutex<Option<PoolInner>>,
}

struct PoolInner {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool with `workers` threads. No thread is spawned until
    /// [`WorkerPool::start`].
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1), inner: std::sync::Mutex::new(None) }
    }

    /// Spawns the worker threads. Starting an already-started pool is a no-op.
    pub fn start(&self) {
        let mut inner = lock(&self.inner);
        if inner.is_some() {
            return;
        }
        let (sender, receiver) = unbounded::<Job>();
        let handles = (0..self.workers)
            .map(|index| {
                let receiver: Receiver<Job> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("weft-callback-{}", index))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                        trace!("callback worker exiting");
                    })
                    .expect("failed to spawn callback worker")
            })
            .collect();
        *inner = Some(PoolInner { sender, handles });
    }

    /// Stops the pool: pending jobs are drained, then the workers exit and
    /// are joined. Stopping a stopped pool is a no-op.
    pub fn stop(&self) {
        let taken = lock(&self.inner).take();
        if let Some(PoolInner { sender, handles }) = taken {
            drop(sender);
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    /// True while worker threads are running.
    pub fn is_running(&self) -> bool {
        lock(&self.inner).is_some()
    }

    /// Enqueues a job. If the pool is not running the job executes inline on
    /// the calling thread so that no event is ever lost.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let submitted = {
            let inner = lock(&self.inner);
            match inner.as_ref() {
                Some(pool) => pool.sender.send(Box::new(job) as Job).map_err(|e| e.into_inner()),
                None => Err(Box::new(job) as Job),
            }
        };
        if let Err(job) = submitted {
            warn!("callback pool not running, invoking callback synchronously");
            job();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    use super::*;

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn executes_submitted_jobs() {
        let pool = WorkerPool::new(2);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 16));
        pool.stop();
    }

    #[test]
    fn single_worker_preserves_enqueue_order() {
        let pool = WorkerPool::new(1);
        pool.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..32usize {
            let seen = seen.clone();
            pool.execute(move || {
                seen.lock().unwrap().push(index);
            });
        }
        pool.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn stop_drains_pending_jobs() {
        let pool = WorkerPool::new(1);
        pool.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.execute(move || {
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn execute_on_stopped_pool_runs_inline() {
        let pool = WorkerPool::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let clone = ran.clone();
        pool.execute(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let pool = WorkerPool::new(1);
        pool.start();
        pool.start();
        assert!(pool.is_running());
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
    }
}
