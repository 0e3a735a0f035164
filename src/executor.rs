//! # Async Executor
//!
//! A small fixed pool of worker tasks that runs work posted from overlay
//! callback threads.
//!
//! The overlay calls back from its own threads, including while it is being
//! torn down. Nothing that mutates launcher state runs on those threads; the
//! callback posts a task here and returns.
//!
//! ## Lanes
//!
//! Each worker owns one FIFO queue (a "lane") and runs its tasks one at a
//! time, to completion, in posting order.
//!
//! | Lane | Work |
//! |------|------|
//! | 0 (serial) | health updates, via [`AsyncExecutor::post`] |
//! | all lanes, round-robin | key-fetch completions, via [`AsyncExecutor::post_completion`] |
//!
//! Lane 0 is the only writer of the health score, so updates are applied in
//! exactly the order the overlay delivered them.
//!
//! `post` is synchronous and safe to call from threads that are not part of a
//! tokio runtime.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A unit of posted work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const SERIAL_LANE: usize = 0;

enum Job {
    Run(Task),
    Flush(oneshot::Sender<()>),
}

/// The executor has been shut down. Carries the task back so the caller
/// can decide what to do with it.
#[derive(thiserror::Error)]
#[error("executor is shut down")]
pub struct ExecutorClosed(Task);

impl ExecutorClosed {
    pub fn into_task(self) -> Task {
        self.0
    }
}

impl fmt::Debug for ExecutorClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutorClosed")
    }
}

#[derive(Clone)]
pub struct AsyncExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    lanes: RwLock<Vec<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_lane: AtomicUsize,
    size: usize,
}

impl AsyncExecutor {
    /// Start `workers` lanes (at least one) on the current tokio runtime.
    pub fn spawn(workers: usize) -> Self {
        let size = workers.max(1);
        let mut lanes = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for lane in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes.push(tx);
            handles.push(tokio::spawn(run_lane(lane, rx)));
        }
        debug!(workers = size, "executor started");

        Self {
            inner: Arc::new(ExecutorInner {
                lanes: RwLock::new(lanes),
                workers: Mutex::new(handles),
                next_lane: AtomicUsize::new(0),
                size,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.size
    }

    /// Enqueue `task` on the serial lane.
    pub fn post<F>(&self, task: F) -> Result<(), ExecutorClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_to(SERIAL_LANE, Box::new(task))
    }

    /// Enqueue `task` on the next lane in round-robin order.
    pub fn post_completion<F>(&self, task: F) -> Result<(), ExecutorClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let lane = self.inner.next_lane.fetch_add(1, Ordering::Relaxed) % self.inner.size;
        self.send_to(lane, Box::new(task))
    }

    fn send_to(&self, lane: usize, task: Task) -> Result<(), ExecutorClosed> {
        let lanes = self.inner.lanes.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = lanes.get(lane) else {
            return Err(ExecutorClosed(task));
        };
        tx.send(Job::Run(task)).map_err(|mpsc::error::SendError(job)| match job {
            Job::Run(task) => ExecutorClosed(task),
            Job::Flush(_) => ExecutorClosed(Box::new(|| {})),
        })
    }

    /// Wait until every task posted before this call has run.
    pub async fn flush(&self) {
        let waiters: Vec<oneshot::Receiver<()>> = {
            let lanes = self.inner.lanes.read().unwrap_or_else(|e| e.into_inner());
            lanes
                .iter()
                .filter_map(|tx| {
                    let (done_tx, done_rx) = oneshot::channel();
                    tx.send(Job::Flush(done_tx)).ok().map(|_| done_rx)
                })
                .collect()
        };
        for done in waiters {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Stop accepting work, let every lane drain, and wait for the workers.
    pub async fn shutdown(&self) {
        let senders = {
            let mut lanes = self.inner.lanes.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *lanes)
        };
        drop(senders);

        let handles = {
            let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "executor worker ended abnormally");
            }
        }
        debug!("executor stopped");
    }
}

async fn run_lane(lane: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Run(task) => {
                // A panicking task must not take the lane (and every task
                // queued behind it) down with it.
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!(lane, "executor task panicked");
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!(lane, "executor lane drained");
}
