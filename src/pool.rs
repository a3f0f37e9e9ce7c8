//! Bounded CPU worker pool.
//!
//! The pool is the concurrency gate for the codec library: tasks queue FIFO
//! on a bounded channel, a dispatcher hands them to blocking threads behind a
//! semaphore sized `max_threads`. A failing task yields a failure outcome;
//! the pool itself only errors when a submission is rejected (saturated queue
//! or shutdown).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::transform::{ImageTransformer, OptimizationOptions, OutputFormat};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 4,
            idle_timeout: Duration::from_millis(5000),
            queue_depth: 10_000,
        }
    }
}

/// One unit of optimization work.
#[derive(Debug, Clone)]
pub struct OptimizeTask {
    pub bytes: Bytes,
    pub options: OptimizationOptions,
    pub original_name: String,
}

/// Result of a task, success or not. `buffer` is empty on failure.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub buffer: Bytes,
    pub format: Option<OutputFormat>,
    pub original_size: usize,
    pub optimized_size: usize,
    pub original_name: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn failure(task: &OptimizeTask, error: String) -> Self {
        Self {
            buffer: Bytes::new(),
            format: None,
            original_size: task.bytes.len(),
            optimized_size: 0,
            original_name: task.original_name.clone(),
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker queue is full")]
    Saturated,
    #[error("worker pool is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub queued: usize,
    pub active: usize,
    pub min_threads: usize,
    pub max_threads: usize,
}

struct Job {
    task: OptimizeTask,
    reply: oneshot::Sender<TaskOutcome>,
}

pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    idle: Arc<Notify>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, transformer: Arc<ImageTransformer>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_depth.max(1));
        let queued = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let idle = Arc::new(Notify::new());

        // Dispatcher: FIFO pull, semaphore bounds concurrent encodes, each
        // task runs on a blocking thread (the runtime parks idle blocking
        // threads past their idle timeout, so the pool is elastic between
        // min and max).
        let permits = Arc::new(Semaphore::new(config.max_threads.max(1)));
        let queued_c = Arc::clone(&queued);
        let active_c = Arc::clone(&active);
        let closed_c = Arc::clone(&closed);
        let idle_c = Arc::clone(&idle);
        tokio::spawn(async move {
            info!(max_threads = permits.available_permits(), "worker pool dispatcher started");
            while let Some(job) = rx.recv().await {
                queued_c.fetch_sub(1, Ordering::AcqRel);
                if closed_c.load(Ordering::Acquire) {
                    // Queued tasks are cancelled by shutdown; dropping the
                    // reply channel signals the submitter.
                    maybe_notify_idle(&queued_c, &active_c, &idle_c);
                    continue;
                }

                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                active_c.fetch_add(1, Ordering::AcqRel);

                let transformer = Arc::clone(&transformer);
                let active = Arc::clone(&active_c);
                let queued = Arc::clone(&queued_c);
                let idle = Arc::clone(&idle_c);
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = run_task(transformer, job.task).await;
                    active.fetch_sub(1, Ordering::AcqRel);
                    maybe_notify_idle(&queued, &active, &idle);
                    let _ = job.reply.send(outcome);
                });
            }
        });

        Self {
            queue: tx,
            queued,
            active,
            closed,
            idle,
            config,
        }
    }

    /// Submit one task; resolves once the task has run to completion (success
    /// or failure). Errors only when the submission itself is rejected.
    pub async fn submit(&self, task: OptimizeTask) -> Result<TaskOutcome, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        let (reply, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.queue.try_send(Job { task, reply }) {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(match err {
                TrySendError::Full(_) => PoolError::Saturated,
                TrySendError::Closed(_) => PoolError::ShutDown,
            });
        }
        rx.await.map_err(|_| PoolError::ShutDown)
    }

    /// Submit a batch; resolves positionally once every task has settled.
    /// Rejection of an individual enqueue (a race against saturation) shows
    /// up as a failure outcome in that slot rather than sinking the batch.
    pub async fn submit_many(
        &self,
        tasks: Vec<OptimizeTask>,
    ) -> Result<Vec<TaskOutcome>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        if self.queued.load(Ordering::Acquire) + tasks.len() > self.config.queue_depth {
            return Err(PoolError::Saturated);
        }
        let results = join_all(tasks.into_iter().map(|task| async move {
            let fallback = TaskOutcome::failure(&task, PoolError::Saturated.to_string());
            match self.submit(task).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(%err, "batch slot rejected by pool");
                    TaskOutcome {
                        error: Some(err.to_string()),
                        ..fallback
                    }
                }
            }
        }))
        .await;
        Ok(results)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queued.load(Ordering::Acquire),
            active: self.active.load(Ordering::Acquire),
            min_threads: self.config.min_threads,
            max_threads: self.config.max_threads,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cheap admission check so accepts can answer 503 instead of queueing
    /// unboundedly.
    pub fn has_capacity(&self, additional: usize) -> bool {
        !self.is_shut_down()
            && self.queued.load(Ordering::Acquire) + additional <= self.config.queue_depth
    }

    /// Reject new submissions, cancel queued tasks, and wait for in-flight
    /// work to drain.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let notified = self.idle.notified();
            if self.queued.load(Ordering::Acquire) == 0 && self.active.load(Ordering::Acquire) == 0
            {
                break;
            }
            notified.await;
        }
        info!("worker pool drained");
    }
}

fn maybe_notify_idle(queued: &AtomicUsize, active: &AtomicUsize, idle: &Notify) {
    if queued.load(Ordering::Acquire) == 0 && active.load(Ordering::Acquire) == 0 {
        idle.notify_waiters();
    }
}

async fn run_task(transformer: Arc<ImageTransformer>, task: OptimizeTask) -> TaskOutcome {
    let original_size = task.bytes.len();
    let original_name = task.original_name.clone();
    let bytes = task.bytes.clone();
    let options = task.options.clone();

    let result =
        tokio::task::spawn_blocking(move || transformer.optimize(&bytes, &options)).await;

    match result {
        Ok(Ok(optimized)) => TaskOutcome {
            optimized_size: optimized.bytes.len(),
            buffer: Bytes::from(optimized.bytes),
            format: Some(optimized.format),
            original_size,
            original_name,
            success: true,
            error: None,
        },
        Ok(Err(err)) => TaskOutcome::failure(&task, err.to_string()),
        Err(join_err) => {
            error!(%join_err, "optimization task aborted");
            TaskOutcome::failure(&task, "optimization task aborted".to_string())
        }
    }
}
