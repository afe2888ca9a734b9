//! # Logic Executor and Worker Pools
//!
//! Three execution lanes:
//!
//! - **Logic lane**: one task owning all shared router state, draining a
//!   bounded queue of jobs. Every mutation of session tables, the RC store,
//!   DHT tables, and path state happens here. This replaces the mutexes the
//!   design otherwise needs: message passing to the lane is the only
//!   mechanism for shared-state mutation.
//! - **Crypto workers**: a small thread pool for CPU-bound jobs (sign,
//!   verify, seal). Pure; results return to the logic lane as new jobs.
//! - **Disk worker**: a single thread serializing all file I/O (keys, RC
//!   cache, profiles).
//!
//! A worker job must never wait on a logic-lane result; with a single-thread
//! pool that deadlocks. Jobs end by either completing in place or posting a
//! continuation back onto the lane.

use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RouterError;

/// A job run on the logic lane with exclusive access to the state.
pub type LogicJob<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Handle for posting jobs onto a logic lane owning state `S`.
pub struct LogicHandle<S> {
    tx: mpsc::Sender<LogicJob<S>>,
}

impl<S> Clone for LogicHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> LogicHandle<S> {
    /// Post a job without waiting. Fails with `QueueFull` when the lane is
    /// saturated; callers on hot paths drop and count rather than block.
    pub fn call(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<(), RouterError> {
        self.tx.try_send(Box::new(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RouterError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RouterError::QueueFull,
        })
    }

    /// Post a job from async context, waiting for queue space.
    pub async fn call_async(&self, job: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).await.is_ok()
    }

    /// Run a job after `delay`. Fire-and-forget; if the lane is gone by then
    /// the job is dropped.
    pub fn call_later(&self, delay: Duration, job: impl FnOnce(&mut S) + Send + 'static) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Box::new(job)).await.is_err() {
                debug!("logic lane closed before delayed call fired");
            }
        });
    }

    /// Run `job` every `interval` until the lane shuts down.
    pub fn call_every(
        &self,
        interval: Duration,
        mut job: impl FnMut(&mut S) + Send + Clone + 'static,
    ) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut j = job.clone();
                if tx.send(Box::new(move |s: &mut S| j(s))).await.is_err() {
                    break;
                }
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the logic lane for `state`. The returned handle posts jobs; the
/// join handle resolves with the final state once every handle is dropped.
pub fn spawn_logic<S: Send + 'static>(
    state: S,
    queue_size: usize,
) -> (LogicHandle<S>, tokio::task::JoinHandle<S>) {
    let (tx, mut rx) = mpsc::channel::<LogicJob<S>>(queue_size.max(1));
    let task = tokio::spawn(async move {
        let mut state = state;
        while let Some(job) = rx.recv().await {
            job(&mut state);
        }
        state
    });
    (LogicHandle { tx }, task)
}

type WorkerJob = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool for CPU-bound crypto jobs.
pub struct WorkerPool {
    tx: Option<std_mpsc::Sender<WorkerJob>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = std_mpsc::channel::<WorkerJob>();
        let rx = Arc::new(Mutex::new(rx));
        let threads = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = rx.lock().expect("worker queue lock poisoned");
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            threads,
        }
    }

    /// Queue a job. Jobs run in submission order per thread but may complete
    /// out of order across threads.
    pub fn add_job(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                warn!("worker pool already stopped, dropping job");
            }
        }
    }

    /// Stop accepting jobs and join every thread after the queue drains.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The serial disk lane: a one-thread pool so file writes never interleave.
pub struct DiskWorker {
    pool: WorkerPool,
}

impl DiskWorker {
    pub fn new() -> Self {
        Self {
            pool: WorkerPool::new("diskworker", 1),
        }
    }

    pub fn add_job(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.add_job(job);
    }

    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

impl Default for DiskWorker {
    fn default() -> Self {
        Self::new()
    }
}
