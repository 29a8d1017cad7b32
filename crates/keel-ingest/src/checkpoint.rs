//! In-memory checkpoint tracking with batched persistence.
//!
//! The ingestor advances an in-memory high-water mark per contract as events
//! are enqueued and persists it when either 100 events have flushed or 5 s
//! have elapsed, whichever comes first. Before persisting an advance, the
//! previously persisted block hash is re-read from the chain; a mismatch is a
//! reorg and the tracker refuses to advance.

use alloy::primitives::{Address, B256};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use keel_chain::ChainGateway;
use keel_store::{Checkpoint, CheckpointStore};

use crate::error::{IngestError, IngestResult};

/// Flush policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Persist after this many enqueued events.
    pub max_events: u64,
    /// Persist at least this often while the mark advances.
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_events: 100,
            max_interval: Duration::from_secs(5),
        }
    }
}

struct ContractMark {
    /// Persisted confirmed block.
    persisted: u64,
    persisted_hash: B256,
    /// In-memory high-water mark (>= persisted).
    mark: u64,
    mark_hash: B256,
    events_since_flush: u64,
    last_flush: Instant,
}

/// Checkpoint tracker for all watched contracts.
pub struct CheckpointTracker {
    store: Arc<dyn CheckpointStore>,
    policy: FlushPolicy,
    marks: HashMap<Address, ContractMark>,
}

impl CheckpointTracker {
    /// Load persisted checkpoints, falling back to the configured genesis.
    pub async fn load(
        store: Arc<dyn CheckpointStore>,
        policy: FlushPolicy,
        contracts: &[Address],
        genesis_block: u64,
    ) -> IngestResult<Self> {
        let mut marks = HashMap::new();
        for &contract in contracts {
            let (block, hash) = match store.checkpoint(contract).await? {
                Some(checkpoint) => {
                    info!(
                        contract = %contract,
                        block = checkpoint.last_confirmed_block,
                        "Resuming from checkpoint"
                    );
                    (checkpoint.last_confirmed_block, checkpoint.block_hash)
                }
                None => {
                    info!(contract = %contract, genesis_block, "No checkpoint, starting at genesis");
                    (genesis_block, B256::ZERO)
                }
            };
            marks.insert(
                contract,
                ContractMark {
                    persisted: block,
                    persisted_hash: hash,
                    mark: block,
                    mark_hash: hash,
                    events_since_flush: 0,
                    last_flush: Instant::now(),
                },
            );
        }
        Ok(Self {
            store,
            policy,
            marks,
        })
    }

    /// Next block to fetch for a contract.
    #[must_use]
    pub fn next_block(&self, contract: Address) -> u64 {
        self.marks
            .get(&contract)
            .map(|m| m.mark + 1)
            .unwrap_or_default()
    }

    /// Advance the in-memory mark after a scanned range, counting enqueued
    /// events toward the flush policy.
    pub fn advance(&mut self, contract: Address, to_block: u64, block_hash: B256, events: u64) {
        if let Some(mark) = self.marks.get_mut(&contract) {
            debug_assert!(to_block >= mark.mark);
            mark.mark = to_block;
            mark.mark_hash = block_hash;
            mark.events_since_flush += events;
        }
    }

    /// Whether the flush policy demands persistence for this contract.
    #[must_use]
    pub fn needs_flush(&self, contract: Address) -> bool {
        self.marks.get(&contract).is_some_and(|m| {
            m.mark > m.persisted
                && (m.events_since_flush >= self.policy.max_events
                    || m.last_flush.elapsed() >= self.policy.max_interval)
        })
    }

    /// Persist the mark for a contract, re-checking the previously persisted
    /// block hash against the canonical chain first.
    ///
    /// A hash mismatch means a confirmed event may have disappeared: the
    /// tracker raises `ReorgDetected` and does not advance. No auto-heal.
    pub async fn flush(
        &mut self,
        contract: Address,
        gateway: &dyn ChainGateway,
    ) -> IngestResult<()> {
        let mark = self
            .marks
            .get_mut(&contract)
            .expect("flush for unwatched contract");

        if mark.persisted_hash != B256::ZERO {
            let canonical = gateway.block_hash(mark.persisted).await?;
            if canonical != Some(mark.persisted_hash) {
                error!(
                    contract = %contract,
                    block = mark.persisted,
                    expected = %mark.persisted_hash,
                    actual = ?canonical,
                    "Persisted block no longer canonical"
                );
                return Err(IngestError::ReorgDetected {
                    contract: contract.to_string(),
                    block: mark.persisted,
                });
            }
        }

        self.store
            .save_checkpoint(&Checkpoint {
                contract,
                last_confirmed_block: mark.mark,
                block_hash: mark.mark_hash,
                updated_at: Utc::now(),
            })
            .await?;
        debug!(contract = %contract, block = mark.mark, "Checkpoint persisted");

        mark.persisted = mark.mark;
        mark.persisted_hash = mark.mark_hash;
        mark.events_since_flush = 0;
        mark.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_chain::MockGateway;
    use keel_store::MemoryStore;

    fn contract() -> Address {
        Address::with_last_byte(0x11)
    }

    async fn tracker(store: Arc<MemoryStore>) -> CheckpointTracker {
        CheckpointTracker::load(store, FlushPolicy::default(), &[contract()], 100)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_genesis_start() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store).await;
        assert_eq!(tracker.next_block(contract()), 101);
    }

    #[tokio::test]
    async fn test_flush_after_event_threshold() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = tracker(store.clone()).await;
        let gateway = MockGateway::new();

        tracker.advance(contract(), 150, B256::with_last_byte(1), 99);
        assert!(!tracker.needs_flush(contract()));
        tracker.advance(contract(), 151, B256::with_last_byte(2), 1);
        assert!(tracker.needs_flush(contract()));

        tracker.flush(contract(), &gateway).await.unwrap();
        assert!(!tracker.needs_flush(contract()));

        let persisted = store.checkpoint(contract()).await.unwrap().unwrap();
        assert_eq!(persisted.last_confirmed_block, 151);
    }

    #[tokio::test]
    async fn test_reorg_detected_on_hash_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let gateway = MockGateway::new();
        let mut tracker = tracker(store.clone()).await;

        // First flush persists block 150 with its hash.
        tracker.advance(contract(), 150, B256::with_last_byte(0xaa), 100);
        gateway.set_block_hash(150, B256::with_last_byte(0xaa));
        tracker.flush(contract(), &gateway).await.unwrap();

        // The chain now reports a different hash for 150.
        gateway.set_block_hash(150, B256::with_last_byte(0xbb));
        tracker.advance(contract(), 160, B256::with_last_byte(0xcc), 100);
        let err = tracker.flush(contract(), &gateway).await.unwrap_err();
        assert!(matches!(err, IngestError::ReorgDetected { block: 150, .. }));

        // Checkpoint did not advance.
        let persisted = store.checkpoint(contract()).await.unwrap().unwrap();
        assert_eq!(persisted.last_confirmed_block, 150);
    }

    #[tokio::test]
    async fn test_checkpoint_resume() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_checkpoint(&Checkpoint {
                contract: contract(),
                last_confirmed_block: 500,
                block_hash: B256::with_last_byte(5),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let tracker = tracker(store).await;
        assert_eq!(tracker.next_block(contract()), 501);
    }
}
