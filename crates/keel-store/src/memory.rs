//! In-memory store for tests and local development.
//!
//! Implements the full store surface plus the coordination KV with real TTL
//! semantics so engine tests exercise the same contracts as production.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use keel_core::{
    ActionResult, Amount, ApprovalRecord, ApprovalTicket, ApproverRole, EventKey, FundProjection,
    PlanStatus, RebalancePlan, RedemptionRequest, RedemptionStatus, ReferenceType, RiskEvent,
    RiskSnapshot, TicketResult, TicketStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::ticket_logic::apply_ticket_action;
use crate::traits::{
    AuditEntry, AuditStore, Checkpoint, CheckpointStore, CommitOutcome, DedupStore, FlowDelta,
    FlowRates, Holding, LeaseStore, PlanStore, ProjectionStore, ProjectionUpdate, RedemptionStats,
    RedemptionStore, RiskStore, TicketActOutcome, TicketStore,
};

#[derive(Default)]
struct Inner {
    fund: Option<FundProjection>,
    redemptions: HashMap<u64, RedemptionRequest>,
    tickets: HashMap<String, ApprovalTicket>,
    plans: HashMap<String, RebalancePlan>,
    holdings: HashMap<Address, Holding>,
    nav: Vec<(DateTime<Utc>, Amount)>,
    snapshots: Vec<RiskSnapshot>,
    risk_events: Vec<RiskEvent>,
    audits: Vec<AuditEntry>,
    processed: HashMap<EventKey, String>,
    checkpoints: HashMap<Address, Checkpoint>,
    flows: Vec<(DateTime<Utc>, FlowDelta)>,
    dedup: HashMap<EventKey, Instant>,
    leases: HashMap<String, (String, Instant)>,
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- test inspection helpers -------------------------------------------

    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    #[must_use]
    pub fn audit_actions(&self) -> Vec<String> {
        self.inner.lock().audits.iter().map(|a| a.action.clone()).collect()
    }

    #[must_use]
    pub fn risk_event_sources(&self) -> Vec<String> {
        self.inner
            .lock()
            .risk_events
            .iter()
            .map(|e| e.source.clone())
            .collect()
    }

    #[must_use]
    pub fn processed_count(&self) -> usize {
        self.inner.lock().processed.len()
    }

    fn apply_update(inner: &mut Inner, update: ProjectionUpdate) {
        if let Some(fund) = update.fund {
            inner.fund = Some(fund);
        }
        if let Some(redemption) = update.redemption {
            inner.redemptions.insert(redemption.request_id, redemption);
        }
        if let Some(delta) = update.holding {
            let entry = inner.holdings.entry(delta.asset).or_insert(Holding {
                asset: delta.asset,
                tier: delta.tier,
                value: Amount::ZERO,
            });
            entry.tier = delta.tier;
            entry.value = entry.value.saturating_add(delta.credit).saturating_sub(delta.debit);
        }
        if let Some(point) = update.nav_point {
            inner.nav.push(point);
        }
        if let Some(event) = update.risk_event {
            inner.risk_events.push(event);
        }
        if let Some(flow) = update.flow {
            inner.flows.push((Utc::now(), flow));
        }
        inner.audits.extend(update.audits);
    }
}

#[async_trait]
impl ProjectionStore for MemoryStore {
    async fn fund(&self) -> StoreResult<FundProjection> {
        Ok(self
            .inner
            .lock()
            .fund
            .clone()
            .unwrap_or_else(FundProjection::genesis))
    }

    async fn commit_event(
        &self,
        key: EventKey,
        kind: &str,
        block_number: u64,
        update: ProjectionUpdate,
    ) -> StoreResult<CommitOutcome> {
        let mut inner = self.inner.lock();
        if inner.processed.contains_key(&key) {
            return Ok(CommitOutcome::AlreadyProcessed);
        }
        inner.processed.insert(key, kind.to_string());
        let mut update = update;
        if let Some(fund) = update.fund.as_mut() {
            fund.last_block = fund.last_block.max(block_number);
        }
        Self::apply_update(&mut inner, update);
        Ok(CommitOutcome::Applied)
    }

    async fn put_fund(&self, fund: &FundProjection) -> StoreResult<()> {
        self.inner.lock().fund = Some(fund.clone());
        Ok(())
    }

    async fn holdings(&self) -> StoreResult<Vec<Holding>> {
        Ok(self.inner.lock().holdings.values().cloned().collect())
    }

    async fn nav_history(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(DateTime<Utc>, Amount)>> {
        Ok(self
            .inner
            .lock()
            .nav
            .iter()
            .filter(|(t, _)| *t >= since)
            .copied()
            .collect())
    }

    async fn flow_rates(&self, window_days: u32) -> StoreResult<FlowRates> {
        let inner = self.inner.lock();
        let total = inner
            .fund
            .as_ref()
            .map(|f| f.total_assets)
            .unwrap_or(Amount::ZERO);
        if total.is_zero() {
            return Ok(FlowRates::default());
        }
        let since = Utc::now() - ChronoDuration::days(window_days as i64);
        let mut deposits = Amount::ZERO;
        let mut redemptions = Amount::ZERO;
        for (at, flow) in &inner.flows {
            if *at >= since {
                deposits = deposits.saturating_add(flow.deposits);
                redemptions = redemptions.saturating_add(flow.redemptions);
            }
        }
        let annualize = 365.0 / window_days.max(1) as f64;
        Ok(FlowRates {
            redemption_rate: redemptions.to_f64_lossy() / total.to_f64_lossy() * annualize,
            deposit_rate: deposits.to_f64_lossy() / total.to_f64_lossy() * annualize,
        })
    }
}

#[async_trait]
impl RedemptionStore for MemoryStore {
    async fn redemption(&self, request_id: u64) -> StoreResult<Option<RedemptionRequest>> {
        Ok(self.inner.lock().redemptions.get(&request_id).cloned())
    }

    async fn upsert_redemption(&self, request: &RedemptionRequest) -> StoreResult<()> {
        self.inner
            .lock()
            .redemptions
            .insert(request.request_id, request.clone());
        Ok(())
    }

    async fn pending_outflow_within(&self, until: DateTime<Utc>) -> StoreResult<Amount> {
        Ok(self
            .inner
            .lock()
            .redemptions
            .values()
            .filter(|r| {
                r.settlement_time <= until
                    && !matches!(
                        r.status,
                        RedemptionStatus::Settled | RedemptionStatus::Cancelled
                    )
            })
            .map(|r| r.gross_amount)
            .sum())
    }

    async fn list_by_status(
        &self,
        status: RedemptionStatus,
        limit: i64,
    ) -> StoreResult<Vec<RedemptionRequest>> {
        let mut matching: Vec<RedemptionRequest> = self
            .inner
            .lock()
            .redemptions
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.request_time);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn redemption_stats(&self) -> StoreResult<RedemptionStats> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut stats = RedemptionStats::default();
        for r in inner.redemptions.values() {
            if !r.status.is_terminal() {
                stats.open_count += 1;
            }
            if r.status == RedemptionStatus::PendingApproval {
                stats.pending_approval_count += 1;
            }
            if r.status == RedemptionStatus::Settled {
                if let Some(at) = r.settled_at {
                    let amount = r.settled_amount.unwrap_or(r.gross_amount);
                    if at >= now - ChronoDuration::hours(24) {
                        stats.settled_24h = stats.settled_24h.saturating_add(amount);
                    }
                    if at >= now - ChronoDuration::days(7) {
                        stats.settled_7d = stats.settled_7d.saturating_add(amount);
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn ticket(&self, id: &str) -> StoreResult<Option<ApprovalTicket>> {
        Ok(self.inner.lock().tickets.get(id).cloned())
    }

    async fn open_ticket_for_reference(
        &self,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .tickets
            .values()
            .find(|t| {
                t.reference_type == reference_type
                    && t.reference_id == reference_id
                    && !t.status.is_terminal()
            })
            .map(|t| t.id.clone()))
    }

    async fn insert_ticket(&self, ticket: &ApprovalTicket) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.tickets.contains_key(&ticket.id) {
            return Err(StoreError::Conflict(format!("ticket {} exists", ticket.id)));
        }
        inner.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    async fn act_on_ticket(
        &self,
        id: &str,
        record: ApprovalRecord,
    ) -> StoreResult<TicketActOutcome> {
        let mut inner = self.inner.lock();
        let ticket = inner
            .tickets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        Ok(apply_ticket_action(ticket, record))
    }

    async fn resolve_ticket(
        &self,
        id: &str,
        status: TicketStatus,
        result: TicketResult,
        resolved_by: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let ticket = inner
            .tickets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        if ticket.status.is_terminal() {
            return Ok(false);
        }
        ticket.status = status;
        ticket.result = Some(result);
        ticket.resolved_at = Some(Utc::now());
        ticket.resolved_by = Some(resolved_by.to_string());
        ticket.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_escalated(
        &self,
        id: &str,
        to: ApproverRole,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let ticket = inner
            .tickets
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))?;
        ticket.escalated_at = Some(at);
        ticket.escalated_to = Some(to);
        ticket.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn plan(&self, id: &str) -> StoreResult<Option<RebalancePlan>> {
        Ok(self.inner.lock().plans.get(id).cloned())
    }

    async fn insert_plan(&self, plan: &RebalancePlan) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.plans.contains_key(&plan.id) {
            return Err(StoreError::Conflict(format!("plan {} exists", plan.id)));
        }
        inner.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn transition_plan(
        &self,
        id: &str,
        from: &[PlanStatus],
        to: PlanStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let plan = inner
            .plans
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        if !from.contains(&plan.status) {
            return Ok(false);
        }
        plan.status = to;
        plan.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_plan_ticket(&self, id: &str, ticket_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let plan = inner
            .plans
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        plan.approval_ticket_id = Some(ticket_id.to_string());
        plan.updated_at = Utc::now();
        Ok(())
    }

    async fn append_action_result(&self, id: &str, result: &ActionResult) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let plan = inner
            .plans
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        plan.results.push(result.clone());
        plan.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RiskStore for MemoryStore {
    async fn append_snapshot(&self, snapshot: &RiskSnapshot) -> StoreResult<()> {
        self.inner.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn recent_snapshots(&self, limit: i64) -> StoreResult<Vec<RiskSnapshot>> {
        let inner = self.inner.lock();
        Ok(inner
            .snapshots
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> StoreResult<()> {
        self.inner.lock().risk_events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.inner.lock().audits.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn checkpoint(&self, contract: Address) -> StoreResult<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.get(&contract).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.checkpoints.get(&checkpoint.contract) {
            if checkpoint.last_confirmed_block < existing.last_confirmed_block {
                return Err(StoreError::Conflict(format!(
                    "checkpoint for {} would move backwards: {} < {}",
                    checkpoint.contract,
                    checkpoint.last_confirmed_block,
                    existing.last_confirmed_block
                )));
            }
        }
        inner
            .checkpoints
            .insert(checkpoint.contract, checkpoint.clone());
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn check_and_mark(&self, key: EventKey, ttl_secs: u64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.dedup.retain(|_, expiry| *expiry > now);
        if inner.dedup.contains_key(&key) {
            return Ok(false);
        }
        inner
            .dedup
            .insert(key, now + Duration::from_secs(ttl_secs));
        Ok(true)
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn acquire(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expiry = now + Duration::from_secs(ttl_secs);
        match inner.leases.get(key) {
            Some((current, until)) if *until > now && current != holder => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(key.to_string(), (holder.to_string(), expiry));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.leases.get_mut(key) {
            Some((current, until)) if *until > now && current == holder => {
                *until = now + Duration::from_secs(ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some((current, _)) = inner.leases.get(key) {
            if current == holder {
                inner.leases.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn key(n: u8) -> EventKey {
        EventKey::new(B256::with_last_byte(n), 0)
    }

    #[tokio::test]
    async fn test_commit_event_is_idempotent() {
        let store = MemoryStore::new();
        let mut fund = FundProjection::genesis();
        fund.total_assets = Amount::from_units(100);

        let update = ProjectionUpdate {
            fund: Some(fund),
            ..Default::default()
        };
        let first = store
            .commit_event(key(1), "DepositProcessed", 10, update.clone())
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Applied);

        let mut replay_fund = FundProjection::genesis();
        replay_fund.total_assets = Amount::from_units(999);
        let replay = store
            .commit_event(
                key(1),
                "DepositProcessed",
                10,
                ProjectionUpdate {
                    fund: Some(replay_fund),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replay, CommitOutcome::AlreadyProcessed);
        // First write stands.
        assert_eq!(store.fund().await.unwrap().total_assets, Amount::from_units(100));
    }

    #[tokio::test]
    async fn test_checkpoint_is_non_decreasing() {
        let store = MemoryStore::new();
        let contract = Address::with_last_byte(1);
        let checkpoint = Checkpoint {
            contract,
            last_confirmed_block: 100,
            block_hash: B256::with_last_byte(1),
            updated_at: Utc::now(),
        };
        store.save_checkpoint(&checkpoint).await.unwrap();

        let backwards = Checkpoint {
            last_confirmed_block: 99,
            ..checkpoint.clone()
        };
        assert!(matches!(
            store.save_checkpoint(&backwards).await,
            Err(StoreError::Conflict(_))
        ));

        let forward = Checkpoint {
            last_confirmed_block: 101,
            ..checkpoint
        };
        store.save_checkpoint(&forward).await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_check_and_mark() {
        let store = MemoryStore::new();
        assert!(store.check_and_mark(key(1), 60).await.unwrap());
        assert!(!store.check_and_mark(key(1), 60).await.unwrap());
        assert!(store.check_and_mark(key(2), 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_exclusivity_and_renew() {
        let store = MemoryStore::new();
        assert!(store.acquire("ingestor", "node-a", 30).await.unwrap());
        assert!(!store.acquire("ingestor", "node-b", 30).await.unwrap());
        // Re-acquire by the holder is fine.
        assert!(store.acquire("ingestor", "node-a", 30).await.unwrap());
        assert!(store.renew("ingestor", "node-a", 30).await.unwrap());
        assert!(!store.renew("ingestor", "node-b", 30).await.unwrap());

        store.release("ingestor", "node-a").await.unwrap();
        assert!(store.acquire("ingestor", "node-b", 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_plan_cas_transition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let plan = RebalancePlan {
            id: "RBL-TEST0001".into(),
            trigger: keel_core::RebalanceTrigger::Manual,
            pre_state: keel_core::TierState {
                l1: Amount::ZERO,
                l2: Amount::ZERO,
                l3: Amount::ZERO,
                total: Amount::ZERO,
            },
            target_state: keel_core::TierState {
                l1: Amount::ZERO,
                l2: Amount::ZERO,
                l3: Amount::ZERO,
                total: Amount::ZERO,
            },
            deviations: Vec::new(),
            actions: Vec::new(),
            total_amount: Amount::ZERO,
            estimated_gas_cost: Amount::ZERO,
            estimated_slippage: keel_core::Bps::ZERO,
            requires_approval: false,
            approval_ticket_id: None,
            status: PlanStatus::Draft,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        store.insert_plan(&plan).await.unwrap();

        assert!(store
            .transition_plan("RBL-TEST0001", &[PlanStatus::Draft], PlanStatus::Approved)
            .await
            .unwrap());
        // Stale transition fails the CAS.
        assert!(!store
            .transition_plan("RBL-TEST0001", &[PlanStatus::Draft], PlanStatus::Executing)
            .await
            .unwrap());
    }
}
