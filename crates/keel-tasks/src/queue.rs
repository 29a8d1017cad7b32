//! Priority task queue.
//!
//! Four levels with per-priority FIFO and at-least-once delivery. Tasks may
//! declare a sequential lane: at most one task per lane is in flight, and
//! lane order is FIFO, which is how per-contract event ordering survives a
//! multi-worker pool. Completed task ids are retained for 24 h so redelivered
//! duplicates are dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

use keel_core::{Priority, TaskKind};

/// How long completed-task results are kept for idempotency checks.
pub const RESULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Completed,
    Failed,
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    /// Idempotency key. Re-enqueueing a completed id is a no-op.
    pub id: String,
    pub kind: TaskKind,
    pub priority: Priority,
    pub lane: Option<String>,
    pub attempt: u32,
    pub max_retries: u32,
}

impl TaskEnvelope {
    /// Envelope with priority and lane derived from the kind.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        let priority = kind.priority();
        let lane = kind.lane();
        Self {
            id: id.into(),
            kind,
            priority,
            lane,
            attempt: 0,
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Default)]
struct QueueInner {
    queues: [VecDeque<TaskEnvelope>; 4],
    /// Lanes with a task currently in flight.
    busy_lanes: HashSet<String>,
    /// Ids currently queued or in flight, to drop duplicate enqueues.
    live: HashSet<String>,
    /// Terminal results with completion time.
    results: HashMap<String, (TaskState, Instant)>,
}

impl QueueInner {
    fn prune_results(&mut self) {
        let now = Instant::now();
        self.results
            .retain(|_, (_, at)| now.duration_since(*at) < RESULT_RETENTION);
    }
}

/// Shared priority queue handle.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a task. Duplicates of live or recently completed ids are
    /// dropped (at-least-once with idempotent redelivery).
    pub fn push(&self, task: TaskEnvelope) {
        let mut inner = self.inner.lock();
        inner.prune_results();
        if inner.live.contains(&task.id) {
            trace!(id = %task.id, "Dropping duplicate live task");
            return;
        }
        if let Some((TaskState::Completed, _)) = inner.results.get(&task.id) {
            trace!(id = %task.id, "Dropping recently completed task");
            return;
        }
        debug!(id = %task.id, kind = %task.kind, priority = %task.priority, "Enqueued");
        inner.live.insert(task.id.clone());
        inner.queues[task.priority as usize].push_back(task);
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Pop the next runnable task, waiting if none is available.
    ///
    /// Per-priority FIFO; tasks whose lane is busy are skipped until the lane
    /// frees up. Cross-priority ordering is not guaranteed.
    pub async fn pop(&self) -> TaskEnvelope {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<TaskEnvelope> {
        let mut inner = self.inner.lock();
        for priority in 0..4 {
            let queue = &inner.queues[priority];
            let position = queue.iter().position(|task| {
                task.lane
                    .as_ref()
                    .map(|lane| !inner.busy_lanes.contains(lane))
                    .unwrap_or(true)
            });
            if let Some(position) = position {
                let task = inner.queues[priority].remove(position).expect("position valid");
                if let Some(lane) = &task.lane {
                    inner.busy_lanes.insert(lane.clone());
                }
                return Some(task);
            }
        }
        None
    }

    /// Mark a task finished and free its lane.
    pub fn complete(&self, task: &TaskEnvelope, state: TaskState) {
        let mut inner = self.inner.lock();
        if let Some(lane) = &task.lane {
            inner.busy_lanes.remove(lane);
        }
        inner.live.remove(&task.id);
        inner.results.insert(task.id.clone(), (state, Instant::now()));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Release a task for retry: frees the lane but keeps the id live so the
    /// scheduler's redelivery is not treated as a duplicate enqueue.
    pub fn release_for_retry(&self, task: &TaskEnvelope) {
        let mut inner = self.inner.lock();
        if let Some(lane) = &task.lane {
            inner.busy_lanes.remove(lane);
        }
        inner.live.remove(&task.id);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Result of a finished task, if still retained.
    #[must_use]
    pub fn result(&self, id: &str) -> Option<TaskState> {
        self.inner.lock().results.get(id).map(|(state, _)| *state)
    }

    /// Queued task count per priority, for metrics.
    #[must_use]
    pub fn depths(&self) -> [usize; 4] {
        let inner = self.inner.lock();
        [
            inner.queues[0].len(),
            inner.queues[1].len(),
            inner.queues[2].len(),
            inner.queues[3].len(),
        ]
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: Priority) -> TaskEnvelope {
        let mut envelope = TaskEnvelope::new(id, TaskKind::RiskIndicatorTick);
        envelope.priority = priority;
        envelope
    }

    fn lane_task(id: &str, lane: &str) -> TaskEnvelope {
        let mut envelope = task(id, Priority::Normal);
        envelope.lane = Some(lane.to_string());
        envelope
    }

    #[test]
    fn test_priority_order() {
        let queue = TaskQueue::new();
        queue.push(task("low", Priority::Low));
        queue.push(task("critical", Priority::Critical));
        queue.push(task("normal", Priority::Normal));

        assert_eq!(queue.try_pop().unwrap().id, "critical");
        assert_eq!(queue.try_pop().unwrap().id, "normal");
        assert_eq!(queue.try_pop().unwrap().id, "low");
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = TaskQueue::new();
        queue.push(task("a", Priority::Normal));
        queue.push(task("b", Priority::Normal));
        queue.push(task("c", Priority::Normal));

        assert_eq!(queue.try_pop().unwrap().id, "a");
        assert_eq!(queue.try_pop().unwrap().id, "b");
        assert_eq!(queue.try_pop().unwrap().id, "c");
    }

    #[test]
    fn test_lane_serialization() {
        let queue = TaskQueue::new();
        queue.push(lane_task("a1", "contract:x"));
        queue.push(lane_task("a2", "contract:x"));
        queue.push(lane_task("b1", "contract:y"));

        let first = queue.try_pop().unwrap();
        assert_eq!(first.id, "a1");
        // a2 shares the busy lane; b1 is runnable.
        let second = queue.try_pop().unwrap();
        assert_eq!(second.id, "b1");
        assert!(queue.try_pop().is_none());

        queue.complete(&first, TaskState::Completed);
        assert_eq!(queue.try_pop().unwrap().id, "a2");
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let queue = TaskQueue::new();
        queue.push(task("once", Priority::Normal));
        queue.push(task("once", Priority::Normal));
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_completed_id_not_requeued() {
        let queue = TaskQueue::new();
        queue.push(task("done", Priority::Normal));
        let envelope = queue.try_pop().unwrap();
        queue.complete(&envelope, TaskState::Completed);

        queue.push(task("done", Priority::Normal));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.result("done"), Some(TaskState::Completed));
    }

    #[test]
    fn test_failed_id_can_requeue() {
        let queue = TaskQueue::new();
        queue.push(task("flaky", Priority::Normal));
        let envelope = queue.try_pop().unwrap();
        queue.complete(&envelope, TaskState::Failed);

        queue.push(task("flaky", Priority::Normal));
        assert!(queue.try_pop().is_some());
    }

    #[tokio::test]
    async fn test_async_pop_wakes_on_push() {
        let queue = TaskQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task("wake", Priority::High));
        let got = popper.await.unwrap();
        assert_eq!(got.id, "wake");
    }
}
