//! Worker pool pulling from the task queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_core::TaskKind;

use crate::error::{TaskError, TaskResult};
use crate::queue::{TaskEnvelope, TaskQueue, TaskState};
use crate::retry::backoff_delay;
use crate::scheduler::Scheduler;

/// Handler the node wires task kinds into.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, kind: &TaskKind) -> TaskResult;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Base delay for retry backoff.
    pub retry_base: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_base: Duration::from_millis(500),
        }
    }
}

/// Horizontally-scaled workers executing tasks at-least-once.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: TaskQueue,
    scheduler: Scheduler,
    handler: Arc<dyn TaskHandler>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        queue: TaskQueue,
        scheduler: Scheduler,
        handler: Arc<dyn TaskHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            scheduler,
            handler,
            shutdown,
        }
    }

    /// Spawn all workers.
    pub fn start(&self) {
        for worker in 0..self.config.workers {
            let queue = self.queue.clone();
            let scheduler = self.scheduler.clone();
            let handler = self.handler.clone();
            let shutdown = self.shutdown.clone();
            let retry_base = self.config.retry_base;
            tokio::spawn(async move {
                info!(worker, "Task worker started");
                loop {
                    let task = tokio::select! {
                        task = queue.pop() => task,
                        () = shutdown.cancelled() => {
                            info!(worker, "Task worker stopped");
                            return;
                        }
                    };
                    run_one(&queue, &scheduler, handler.as_ref(), task, retry_base).await;
                }
            });
        }
    }
}

async fn run_one(
    queue: &TaskQueue,
    scheduler: &Scheduler,
    handler: &dyn TaskHandler,
    mut task: TaskEnvelope,
    retry_base: Duration,
) {
    task.attempt += 1;
    debug!(id = %task.id, kind = %task.kind, attempt = task.attempt, "Running task");

    match handler.handle(&task.kind).await {
        Ok(()) => {
            queue.complete(&task, TaskState::Completed);
        }
        Err(TaskError::Retryable(reason)) if task.attempt <= task.max_retries => {
            let delay = backoff_delay(retry_base, task.attempt);
            warn!(
                id = %task.id,
                attempt = task.attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Task failed, retrying"
            );
            queue.release_for_retry(&task);
            scheduler.schedule_after(task, delay);
        }
        Err(e) => {
            error!(id = %task.id, kind = %task.kind, error = %e, "Task failed permanently");
            queue.complete(&task, TaskState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FlakyHandler {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _kind: &TaskKind) -> TaskResult {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                Err(TaskError::retryable("transient"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let queue = TaskQueue::new();
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::spawn(queue.clone(), shutdown.clone());
        let handler = Arc::new(FlakyHandler {
            failures_left: Mutex::new(2),
            calls: Mutex::new(0),
        });

        let pool = WorkerPool::new(
            WorkerConfig {
                workers: 1,
                retry_base: Duration::from_millis(5),
            },
            queue.clone(),
            scheduler,
            handler.clone(),
            shutdown.clone(),
        );
        pool.start();

        queue.push(TaskEnvelope::new("flaky", TaskKind::RiskIndicatorTick));

        // Two failures + one success within the retry budget of 3.
        for _ in 0..100 {
            if queue.result("flaky") == Some(TaskState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.result("flaky"), Some(TaskState::Completed));
        assert_eq!(*handler.calls.lock(), 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_task() {
        let queue = TaskQueue::new();
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::spawn(queue.clone(), shutdown.clone());
        let handler = Arc::new(FlakyHandler {
            failures_left: Mutex::new(100),
            calls: Mutex::new(0),
        });

        let pool = WorkerPool::new(
            WorkerConfig {
                workers: 1,
                retry_base: Duration::from_millis(1),
            },
            queue.clone(),
            scheduler,
            handler,
            shutdown.clone(),
        );
        pool.start();

        queue.push(
            TaskEnvelope::new("hopeless", TaskKind::RiskIndicatorTick).with_max_retries(2),
        );

        for _ in 0..100 {
            if queue.result("hopeless").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.result("hopeless"), Some(TaskState::Failed));
        shutdown.cancel();
    }
}
