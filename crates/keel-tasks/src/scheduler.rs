//! Deferred and periodic task scheduling.
//!
//! Deferred tasks (SLA timers, retries) live in a `DelayQueue` owned by a
//! single driver task; other components talk to it through a command channel,
//! so cancellation and insertion never contend on the queue itself. Periodic
//! declarations are plain interval loops that enqueue a fresh envelope per
//! tick.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info, trace};

use crate::queue::{TaskEnvelope, TaskQueue};

enum Command {
    /// Enqueue the envelope after the delay.
    After(TaskEnvelope, Duration),
    /// Drop a pending deferred task by id.
    Cancel(String),
}

/// Handle for scheduling deferred tasks.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Spawn the driver task and return the handle.
    #[must_use]
    pub fn spawn(queue: TaskQueue, shutdown: CancellationToken) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(queue, rx, shutdown));
        Self { commands }
    }

    /// Enqueue `task` after `delay`. Replaces any pending deferred task with
    /// the same id.
    pub fn schedule_after(&self, task: TaskEnvelope, delay: Duration) {
        let _ = self.commands.send(Command::After(task, delay));
    }

    /// Cancel a pending deferred task. A task already handed to the queue is
    /// unaffected.
    pub fn cancel(&self, id: &str) {
        let _ = self.commands.send(Command::Cancel(id.to_string()));
    }

    /// Spawn a periodic declaration: every `every`, build and enqueue a task.
    pub fn spawn_periodic<F>(
        &self,
        label: &'static str,
        every: Duration,
        queue: TaskQueue,
        shutdown: CancellationToken,
        make: F,
    ) where
        F: Fn() -> TaskEnvelope + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            info!(label, every_secs = every.as_secs(), "Periodic task armed");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.push(make());
                    }
                    () = shutdown.cancelled() => {
                        info!(label, "Periodic task stopped");
                        return;
                    }
                }
            }
        });
    }
}

async fn drive(
    queue: TaskQueue,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut delay_queue: DelayQueue<TaskEnvelope> = DelayQueue::new();
    let mut keys: HashMap<String, Key> = HashMap::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!(pending = keys.len(), "Scheduler shutting down");
                return;
            }
            command = commands.recv() => {
                match command {
                    Some(Command::After(task, delay)) => {
                        if let Some(old) = keys.remove(&task.id) {
                            delay_queue.try_remove(&old);
                        }
                        trace!(id = %task.id, delay_ms = delay.as_millis() as u64, "Deferred");
                        let key = delay_queue.insert(task.clone(), delay);
                        keys.insert(task.id, key);
                    }
                    Some(Command::Cancel(id)) => {
                        if let Some(key) = keys.remove(&id) {
                            delay_queue.try_remove(&key);
                            debug!(id = %id, "Deferred task cancelled");
                        }
                    }
                    None => return,
                }
            }
            Some(expired) = delay_queue.next(), if !delay_queue.is_empty() => {
                let task = expired.into_inner();
                keys.remove(&task.id);
                queue.push(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::TaskKind;

    fn envelope(id: &str) -> TaskEnvelope {
        TaskEnvelope::new(id, TaskKind::RiskIndicatorTick)
    }

    #[tokio::test]
    async fn test_deferred_task_fires() {
        let queue = TaskQueue::new();
        let scheduler = Scheduler::spawn(queue.clone(), CancellationToken::new());

        scheduler.schedule_after(envelope("later"), Duration::from_millis(30));
        assert!(queue.try_pop().is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(queue.try_pop().unwrap().id, "later");
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let queue = TaskQueue::new();
        let scheduler = Scheduler::spawn(queue.clone(), CancellationToken::new());

        scheduler.schedule_after(envelope("doomed"), Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.cancel("doomed");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_reschedule_replaces_pending() {
        let queue = TaskQueue::new();
        let scheduler = Scheduler::spawn(queue.clone(), CancellationToken::new());

        scheduler.schedule_after(envelope("once"), Duration::from_millis(30));
        scheduler.schedule_after(envelope("once"), Duration::from_millis(60));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }
}
