// SPDX-License-Identifier: AGPL-3.0-only

//! Worker thread pool
//!
//! Named OS threads consume boxed jobs from one FIFO queue. A job runs to
//! completion on its worker; there is no preemption. A panicking job is
//! caught and its worker keeps serving the queue. Dropping the pool lets
//! the workers drain the queue, then joins them.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::validate_thread_count;
use crate::error::{GnaError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    running: usize,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// Fixed-size pool of scoring threads
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerPool {
    /// Start `thread_count` workers
    ///
    /// # Errors
    ///
    /// [`GnaError::ThreadCountInvalid`] outside the supported range and
    /// [`GnaError::Io`] when a thread cannot be spawned.
    pub fn new(thread_count: usize) -> Result<Self> {
        validate_thread_count(thread_count)?;
        let shared = Arc::new(Shared::default());
        let workers = spawn(&shared, thread_count)?;
        tracing::debug!("Started {thread_count} worker threads");
        Ok(Self { shared, workers })
    }

    /// Worker threads
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.shared.state.lock().jobs.push_back(Box::new(job));
        self.shared.available.notify_one();
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state.jobs.len() + state.running
    }

    /// Replace the workers with `count` new ones
    ///
    /// # Errors
    ///
    /// [`GnaError::ThreadCountInvalid`] outside the supported range,
    /// [`GnaError::RequestsPending`] while jobs are queued or running and
    /// [`GnaError::Io`] when a thread cannot be spawned.
    pub fn set_thread_count(&mut self, count: usize) -> Result<()> {
        validate_thread_count(count)?;
        let pending = self.pending();
        if pending > 0 {
            return Err(GnaError::RequestsPending {
                reason: format!("{pending} jobs in the worker pool"),
            });
        }
        self.shutdown();
        self.shared = Arc::new(Shared::default());
        self.workers = spawn(&self.shared, count)?;
        tracing::info!("Worker pool resized to {count} threads");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn(shared: &Arc<Shared>, count: usize) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|index| {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(format!("gna-worker-{index}"))
                .spawn(move || run(&shared))
                .map_err(GnaError::from)
        })
        .collect()
}

fn run(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.running += 1;
                    break job;
                }
                if state.stop {
                    return;
                }
                shared.available.wait(&mut state);
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("Worker job panicked");
        }
        shared.state.lock().running -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_named_workers() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.execute(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            });
        }
        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(name.starts_with("gna-worker-"));
        }
    }

    #[test]
    fn test_drop_drains_queue() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(1).unwrap();
            for _ in 0..8 {
                let done = Arc::clone(&done);
                pool.execute(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_resize_rejected_while_busy() {
        let mut pool = WorkerPool::new(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            pool.set_thread_count(4),
            Err(GnaError::RequestsPending { .. })
        ));
        release_tx.send(()).unwrap();
        // Give the worker time to finish the job.
        for _ in 0..500 {
            if pool.pending() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        pool.set_thread_count(4).unwrap();
        assert_eq!(pool.thread_count(), 4);
    }

    #[test]
    fn test_panicking_job_does_not_stall_pool() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute(|| panic!("scoring failed"));
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..500 {
            if pool.pending() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_thread_count_validated() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(GnaError::ThreadCountInvalid { count: 0 })
        ));
    }
}
