//! The event ingestor singleton.
//!
//! Delivers every confirmed event exactly once to the dispatcher, in
//! `(block_number, log_index)` order per contract. The polling loop is the
//! correctness path; the WS subscription only shortens latency. A distributed
//! lease enforces a single active instance; losing the lease exits the loop
//! and a replacement resumes from the persisted checkpoint.

use alloy::primitives::Address;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_chain::{with_backoff, ChainGateway};
use keel_core::{ChainEvent, CoreError, LogRecord, TaskKind};
use keel_store::{DedupStore, LeaseStore};
use keel_tasks::{TaskEnvelope, TaskQueue};

use crate::checkpoint::{CheckpointTracker, FlushPolicy};
use crate::error::{IngestError, IngestResult};

/// Lease key the ingestor singleton runs under.
pub const INGESTOR_LEASE_KEY: &str = "singleton:ingestor";

/// Ingestor configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub contracts: Vec<Address>,
    /// Starting block when no checkpoint exists.
    pub genesis_block: u64,
    /// Confirmation depth; candidate logs require
    /// `block_number <= head - confirmations`.
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Max blocks fetched per contract per poll.
    pub batch_size: u64,
    pub dedup_ttl_secs: u64,
    pub lease_ttl_secs: u64,
    pub lease_renew_interval: Duration,
    /// `get_logs` retry budget before raising an operational alert.
    pub get_logs_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            contracts: Vec::new(),
            genesis_block: 0,
            confirmations: 15,
            poll_interval: Duration::from_secs(3),
            batch_size: 1000,
            dedup_ttl_secs: 7 * 24 * 3600,
            lease_ttl_secs: 30,
            lease_renew_interval: Duration::from_secs(15),
            get_logs_retries: 10,
        }
    }
}

/// Operator commands routed into the running ingestor.
#[derive(Debug, Clone)]
pub enum IngestCommand {
    /// Re-fetch a historical range; dedup and `event_processed` make the
    /// replay a no-op for anything already handled.
    Resync { from_block: u64 },
}

/// Operational alerts the node routes to risk events and notifications.
#[derive(Debug, Clone)]
pub enum IngestAlert {
    /// Fatal: ingestion halted, human intervention required.
    ReorgDetected { contract: String, block: u64 },
    /// `get_logs` exhausted its retry budget; advancement is paused.
    PollFailing { error: String },
    /// The lease was lost; this instance stopped.
    LeaseLost,
}

/// Counters exposed through metrics and the sync-status query.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub events_enqueued: AtomicU64,
    pub events_deduped: AtomicU64,
    pub events_skipped: AtomicU64,
    pub errors: AtomicU64,
    pub latest_chain_block: AtomicU64,
    pub current_block: AtomicU64,
}

impl IngestStats {
    /// Blocks between the chain head and the slowest contract mark.
    #[must_use]
    pub fn blocks_behind(&self) -> u64 {
        self.latest_chain_block
            .load(Ordering::Relaxed)
            .saturating_sub(self.current_block.load(Ordering::Relaxed))
    }
}

/// The ingestor singleton.
pub struct Ingestor {
    config: IngestConfig,
    gateway: Arc<dyn ChainGateway>,
    dedup: Arc<dyn DedupStore>,
    leases: Arc<dyn LeaseStore>,
    tracker: CheckpointTracker,
    queue: TaskQueue,
    alerts: mpsc::Sender<IngestAlert>,
    stats: Arc<IngestStats>,
    instance_id: String,
    halted: AtomicBool,
    shutdown: CancellationToken,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: IngestConfig,
        gateway: Arc<dyn ChainGateway>,
        dedup: Arc<dyn DedupStore>,
        leases: Arc<dyn LeaseStore>,
        checkpoints: Arc<dyn keel_store::CheckpointStore>,
        queue: TaskQueue,
        alerts: mpsc::Sender<IngestAlert>,
        shutdown: CancellationToken,
    ) -> IngestResult<Self> {
        let tracker = CheckpointTracker::load(
            checkpoints,
            FlushPolicy::default(),
            &config.contracts,
            config.genesis_block,
        )
        .await?;
        Ok(Self {
            config,
            gateway,
            dedup,
            leases,
            tracker,
            queue,
            alerts,
            stats: Arc::new(IngestStats::default()),
            instance_id: format!("ingestor-{}", uuid::Uuid::new_v4().simple()),
            halted: AtomicBool::new(false),
            shutdown,
        })
    }

    #[must_use]
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Whether ingestion is halted by a detected reorg.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Run until shutdown or lease loss.
    pub async fn run(self) -> IngestResult<()> {
        let (_tx, rx) = mpsc::channel(1);
        self.run_with_commands(rx).await
    }

    /// Run with an operator command channel.
    pub async fn run_with_commands(
        mut self,
        commands: mpsc::Receiver<IngestCommand>,
    ) -> IngestResult<()> {
        let mut commands = Some(commands);
        // Block until this instance holds the singleton lease.
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            if self
                .leases
                .acquire(
                    INGESTOR_LEASE_KEY,
                    &self.instance_id,
                    self.config.lease_ttl_secs,
                )
                .await?
            {
                info!(instance = %self.instance_id, "Ingestor lease acquired");
                break;
            }
            debug!("Ingestor lease held elsewhere, waiting");
            tokio::time::sleep(self.config.lease_renew_interval).await;
        }

        // The subscription feeds the same dedup path as the poller.
        let mut subscription = match self
            .gateway
            .subscribe_logs(&self.config.contracts, self.tracker_floor())
            .await
        {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(error = %e, "Log subscription unavailable, poller only");
                None
            }
        };

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut renew = tokio::time::interval(self.config.lease_renew_interval);

        let result = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Ingestor shutting down");
                    break Ok(());
                }
                _ = renew.tick() => {
                    match self
                        .leases
                        .renew(INGESTOR_LEASE_KEY, &self.instance_id, self.config.lease_ttl_secs)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            error!("Ingestor lease lost, stopping");
                            let _ = self.alerts.send(IngestAlert::LeaseLost).await;
                            break Err(IngestError::LeaseLost);
                        }
                        Err(e) => {
                            // KV hiccup: keep going; the TTL window tolerates
                            // one missed renewal.
                            warn!(error = %e, "Lease renewal failed");
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        match e {
                            IngestError::ReorgDetected { ref contract, block } => {
                                error!(contract = %contract, block, "REORG: ingestion halted");
                                self.halted.store(true, Ordering::SeqCst);
                                let _ = self
                                    .alerts
                                    .send(IngestAlert::ReorgDetected {
                                        contract: contract.clone(),
                                        block,
                                    })
                                    .await;
                                // Halt: keep the lease but stop advancing.
                            }
                            other => {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %other, "Poll cycle failed");
                                let _ = self
                                    .alerts
                                    .send(IngestAlert::PollFailing {
                                        error: other.to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                }
                command = recv_opt(&mut commands) => {
                    match command {
                        Some(IngestCommand::Resync { from_block }) => {
                            match self.resync_from(from_block).await {
                                Ok(enqueued) => info!(from_block, enqueued, "Operator resync"),
                                Err(e) => warn!(error = %e, "Resync failed"),
                            }
                        }
                        None => commands = None,
                    }
                }
                received = recv_opt(&mut subscription) => {
                    match received {
                        Some(record) => {
                            if let Err(e) = self.process_subscribed(record).await {
                                warn!(error = %e, "Subscription record failed");
                            }
                        }
                        None => {
                            // Stream ended; fall back to poller-only.
                            warn!("Log subscription stream ended");
                            subscription = None;
                        }
                    }
                }
            }
        };

        self.leases
            .release(INGESTOR_LEASE_KEY, &self.instance_id)
            .await
            .ok();
        result
    }

    fn tracker_floor(&self) -> u64 {
        self.config
            .contracts
            .iter()
            .map(|&c| self.tracker.next_block(c))
            .min()
            .unwrap_or(self.config.genesis_block)
    }

    /// One polling cycle across all contracts.
    pub async fn poll_once(&mut self) -> IngestResult<()> {
        if self.is_halted() {
            return Ok(());
        }

        let head = self.gateway.block_number().await?;
        self.stats.latest_chain_block.store(head, Ordering::Relaxed);
        let safe = head.saturating_sub(self.config.confirmations);

        for &contract in &self.config.contracts.clone() {
            let from = self.tracker.next_block(contract);
            if from > safe {
                continue;
            }
            let to = (from + self.config.batch_size - 1).min(safe);

            let gateway = self.gateway.clone();
            let contracts = [contract];
            let records = with_backoff(
                "get_logs",
                self.config.get_logs_retries,
                Duration::from_secs(1),
                Duration::from_secs(30),
                || gateway.get_logs(&contracts, from, to),
            )
            .await?;

            let enqueued = self.enqueue_batch(&records).await?;
            let range_hash = match records.last() {
                Some(last) if last.block_number == to => last.block_hash,
                _ => self
                    .gateway
                    .block_hash(to)
                    .await?
                    .unwrap_or_default(),
            };

            self.tracker.advance(contract, to, range_hash, enqueued);
            self.stats.current_block.store(to, Ordering::Relaxed);

            if self.tracker.needs_flush(contract) {
                self.tracker.flush(contract, self.gateway.as_ref()).await?;
            }

            if enqueued > 0 {
                info!(contract = %contract, from, to, enqueued, "Processed log range");
            }
        }
        Ok(())
    }

    /// Operator-commanded resync: re-fetch a historical range and enqueue
    /// whatever the dedup layer does not recognize. Replays are no-ops at the
    /// projection, and the durable checkpoint never moves backwards.
    pub async fn resync_from(&mut self, from_block: u64) -> IngestResult<u64> {
        let head = self.gateway.block_number().await?;
        let safe = head.saturating_sub(self.config.confirmations);
        if from_block > safe {
            return Ok(0);
        }
        let mut total = 0u64;
        for &contract in &self.config.contracts.clone() {
            let records = self
                .gateway
                .get_logs(&[contract], from_block, safe)
                .await?;
            total += self.enqueue_batch(&records).await?;
        }
        info!(from_block, to = safe, enqueued = total, "Resync complete");
        Ok(total)
    }

    async fn process_subscribed(&mut self, record: LogRecord) -> IngestResult<()> {
        let head = self.stats.latest_chain_block.load(Ordering::Relaxed);
        // Under-confirmed live logs are deferred; the poller picks them up.
        if head > 0 && record.block_number > head.saturating_sub(self.config.confirmations) {
            return Ok(());
        }
        self.enqueue_batch(std::slice::from_ref(&record)).await?;
        Ok(())
    }

    /// Dedup-check and enqueue records; returns how many were enqueued.
    async fn enqueue_batch(&mut self, records: &[LogRecord]) -> IngestResult<u64> {
        let mut sorted: Vec<&LogRecord> = records.iter().collect();
        sorted.sort_by_key(|r| (r.block_number, r.log_index));

        let mut enqueued = 0u64;
        for record in sorted {
            let key = record.key();

            let event = match ChainEvent::decode(record) {
                Ok(event) => event,
                Err(CoreError::UnknownEvent(name)) => {
                    warn!(event = %name, key = %key, "Unknown event, skipping");
                    self.stats.events_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable event, skipping");
                    self.stats.events_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let fresh = self
                .dedup
                .check_and_mark(key, self.config.dedup_ttl_secs)
                .await?;
            if !fresh {
                self.stats.events_deduped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let task = TaskEnvelope::new(
                format!("event:{key}"),
                TaskKind::ProcessEvent {
                    event: Box::new(event),
                },
            );
            self.queue.push(task);
            self.stats.events_enqueued.fetch_add(1, Ordering::Relaxed);
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

async fn recv_opt<T>(channel: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match channel {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;
    use chrono::Utc;
    use keel_chain::MockGateway;
    use keel_store::MemoryStore;
    use serde_json::json;

    fn contract() -> Address {
        Address::with_last_byte(0x11)
    }

    fn log(block: u64, index: u64, tx: u8) -> LogRecord {
        LogRecord {
            contract: contract(),
            tx_hash: B256::with_last_byte(tx),
            log_index: index,
            block_number: block,
            block_hash: B256::with_last_byte((block % 251) as u8),
            block_time: Utc::now(),
            name: "ManagementFeeCollected".to_string(),
            params: json!({ "amount": "1000000000000000000" }),
        }
    }

    async fn build(
        gateway: Arc<MockGateway>,
        store: Arc<MemoryStore>,
    ) -> (Ingestor, TaskQueue, mpsc::Receiver<IngestAlert>) {
        let queue = TaskQueue::new();
        let (alerts_tx, alerts_rx) = mpsc::channel(16);
        let config = IngestConfig {
            contracts: vec![contract()],
            genesis_block: 0,
            confirmations: 15,
            ..IngestConfig::default()
        };
        let ingestor = Ingestor::new(
            config,
            gateway,
            store.clone(),
            store.clone(),
            store,
            queue.clone(),
            alerts_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (ingestor, queue, alerts_rx)
    }

    #[tokio::test]
    async fn test_confirmation_boundary() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_head(100);
        // Exactly at head - confirmations: accepted.
        gateway.push_log(log(85, 0, 1));
        // One past the boundary: deferred.
        gateway.push_log(log(86, 0, 2));
        gateway.set_block_hash(85, B256::with_last_byte(85));

        let store = Arc::new(MemoryStore::new());
        let (mut ingestor, queue, _alerts) = build(gateway.clone(), store).await;

        ingestor.poll_once().await.unwrap();
        let first = queue.try_pop().expect("boundary event accepted");
        assert!(first.id.contains(":0"));
        assert!(
            queue.try_pop().is_none(),
            "block past the confirmation boundary must be deferred"
        );
    }

    #[tokio::test]
    async fn test_dedup_drops_redelivery() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_head(100);
        gateway.push_log(log(50, 0, 1));
        gateway.set_block_hash(85, B256::with_last_byte(85));

        let store = Arc::new(MemoryStore::new());
        let (mut ingestor, queue, _alerts) = build(gateway.clone(), store).await;

        ingestor.poll_once().await.unwrap();
        assert!(queue.try_pop().is_some());

        // Same log redelivered via resync: dedup drops it.
        let enqueued = ingestor.resync_from(0).await.unwrap();
        assert_eq!(enqueued, 0);
        assert_eq!(
            ingestor.stats().events_deduped.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_per_contract_order_is_block_then_log_index() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_head(100);
        gateway.push_log(log(50, 1, 3));
        gateway.push_log(log(50, 0, 2));
        gateway.push_log(log(49, 0, 1));
        gateway.set_block_hash(85, B256::with_last_byte(85));

        let store = Arc::new(MemoryStore::new());
        let (mut ingestor, queue, _alerts) = build(gateway.clone(), store).await;
        ingestor.poll_once().await.unwrap();

        // Same lane, so pops serialize; complete each to release the lane.
        let mut order = Vec::new();
        while let Some(task) = queue.try_pop() {
            order.push(task.id.clone());
            queue.complete(&task, keel_tasks::TaskState::Completed);
        }
        assert_eq!(order.len(), 3);
        let positions: Vec<usize> = ["01:0", "02:0", "03:1"]
            .iter()
            .map(|suffix| order.iter().position(|id| id.ends_with(suffix)).unwrap())
            .collect();
        assert!(positions[0] < positions[1]);
        assert!(positions[1] < positions[2]);
    }

    #[tokio::test]
    async fn test_unknown_event_skipped_without_blocking() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_head(100);
        let mut bad = log(50, 0, 1);
        bad.name = "SomethingElse".to_string();
        gateway.push_log(bad);
        gateway.push_log(log(51, 0, 2));
        gateway.set_block_hash(85, B256::with_last_byte(85));

        let store = Arc::new(MemoryStore::new());
        let (mut ingestor, queue, _alerts) = build(gateway.clone(), store).await;
        ingestor.poll_once().await.unwrap();

        assert!(queue.try_pop().is_some());
        assert_eq!(ingestor.stats().events_skipped.load(Ordering::Relaxed), 1);
    }
}
