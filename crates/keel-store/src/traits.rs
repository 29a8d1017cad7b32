//! Store traits the engines are written against.
//!
//! The core needs transactional CRUD plus time-range queries; any ACID store
//! with time-series retention qualifies. Postgres is the production
//! implementation, `MemoryStore` backs the tests.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use keel_core::{
    Amount, ApprovalRecord, ApprovalTicket, ApproverRole, EventKey, FundProjection, PlanStatus,
    RebalancePlan, RedemptionRequest, RedemptionStatus, ReferenceType, RiskEvent, RiskSnapshot,
    TicketResult, TicketStatus,
};

use crate::error::StoreResult;

/// One audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: Option<String>,
    pub detail: Value,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            actor: None,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Change to one asset holding.
#[derive(Debug, Clone)]
pub struct HoldingDelta {
    pub asset: Address,
    pub tier: keel_core::Tier,
    pub credit: Amount,
    pub debit: Amount,
}

/// Daily flow aggregate increment used by the forecaster's history.
#[derive(Debug, Clone, Default)]
pub struct FlowDelta {
    pub deposits: Amount,
    pub redemptions: Amount,
}

/// All writes one event handler produces, applied in a single transaction
/// together with the `event_processed` audit row.
#[derive(Debug, Clone, Default)]
pub struct ProjectionUpdate {
    pub fund: Option<FundProjection>,
    pub redemption: Option<RedemptionRequest>,
    pub holding: Option<HoldingDelta>,
    /// NAV time-series point (share price).
    pub nav_point: Option<(DateTime<Utc>, Amount)>,
    pub risk_event: Option<RiskEvent>,
    pub flow: Option<FlowDelta>,
    pub audits: Vec<AuditEntry>,
}

impl ProjectionUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fund.is_none()
            && self.redemption.is_none()
            && self.holding.is_none()
            && self.nav_point.is_none()
            && self.risk_event.is_none()
            && self.flow.is_none()
            && self.audits.is_empty()
    }
}

/// Outcome of an event commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The `(tx_hash, log_index)` row already existed; nothing was written.
    AlreadyProcessed,
}

/// One asset holding row.
#[derive(Debug, Clone)]
pub struct Holding {
    pub asset: Address,
    pub tier: keel_core::Tier,
    pub value: Amount,
}

/// Aggregates feeding the redemption-pressure indicators.
#[derive(Debug, Clone, Default)]
pub struct RedemptionStats {
    pub open_count: u64,
    pub pending_approval_count: u64,
    pub settled_24h: Amount,
    pub settled_7d: Amount,
}

/// Historical flow rates for the forecaster, annualized fractions.
#[derive(Debug, Clone, Default)]
pub struct FlowRates {
    pub redemption_rate: f64,
    pub deposit_rate: f64,
}

/// Per-contract ingestion checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub contract: Address,
    pub last_confirmed_block: u64,
    /// Canonical hash of `last_confirmed_block` when the checkpoint was
    /// persisted; re-checked on advance to detect reorgs.
    pub block_hash: alloy::primitives::B256,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Projection
// ============================================================================

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// The singleton fund row; genesis values if never written.
    async fn fund(&self) -> StoreResult<FundProjection>;

    /// Apply one event's writes atomically with its `event_processed` row.
    ///
    /// Replays return `AlreadyProcessed` and leave every table untouched.
    async fn commit_event(
        &self,
        key: EventKey,
        kind: &str,
        block_number: u64,
        update: ProjectionUpdate,
    ) -> StoreResult<CommitOutcome>;

    /// Direct projection write for the rebalance executor's verification step.
    async fn put_fund(&self, fund: &FundProjection) -> StoreResult<()>;

    async fn holdings(&self) -> StoreResult<Vec<Holding>>;

    /// NAV series since `since`, ascending.
    async fn nav_history(&self, since: DateTime<Utc>) -> StoreResult<Vec<(DateTime<Utc>, Amount)>>;

    /// Annualized historical flow rates over a trailing window.
    async fn flow_rates(&self, window_days: u32) -> StoreResult<FlowRates>;
}

// ============================================================================
// Redemptions
// ============================================================================

#[async_trait]
pub trait RedemptionStore: Send + Sync {
    async fn redemption(&self, request_id: u64) -> StoreResult<Option<RedemptionRequest>>;

    async fn upsert_redemption(&self, request: &RedemptionRequest) -> StoreResult<()>;

    /// Confirmed outflow: Σ gross for `settlement_time <= until` over requests
    /// that are neither settled nor cancelled.
    async fn pending_outflow_within(&self, until: DateTime<Utc>) -> StoreResult<Amount>;

    async fn list_by_status(
        &self,
        status: RedemptionStatus,
        limit: i64,
    ) -> StoreResult<Vec<RedemptionRequest>>;

    async fn redemption_stats(&self) -> StoreResult<RedemptionStats>;
}

// ============================================================================
// Tickets
// ============================================================================

/// Outcome of the transactional approve/reject step.
#[derive(Debug, Clone)]
pub enum TicketActOutcome {
    /// Record appended; the returned ticket reflects the new accounting.
    Applied(Box<ApprovalTicket>),
    /// Ticket was already terminal.
    Terminal(TicketStatus),
    /// The actor already acted on this ticket.
    DuplicateActor,
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn ticket(&self, id: &str) -> StoreResult<Option<ApprovalTicket>>;

    /// Open (non-terminal) ticket for a reference, if one exists.
    async fn open_ticket_for_reference(
        &self,
        reference_type: ReferenceType,
        reference_id: &str,
    ) -> StoreResult<Option<String>>;

    async fn insert_ticket(&self, ticket: &ApprovalTicket) -> StoreResult<()>;

    /// Append an action under a row lock and update the accounting.
    ///
    /// Terminal-status and duplicate-actor checks run inside the same
    /// transaction; two racing approvers observe consistent counts. A
    /// rejection resolves the ticket REJECTED; an approval reaching
    /// `required_approvals` resolves it APPROVED, otherwise the ticket moves
    /// to PARTIALLY_APPROVED.
    async fn act_on_ticket(
        &self,
        id: &str,
        record: ApprovalRecord,
    ) -> StoreResult<TicketActOutcome>;

    /// Move a live ticket to a terminal status. Returns false if it was
    /// already terminal (no-op).
    async fn resolve_ticket(
        &self,
        id: &str,
        status: TicketStatus,
        result: TicketResult,
        resolved_by: &str,
    ) -> StoreResult<bool>;

    async fn mark_escalated(
        &self,
        id: &str,
        to: ApproverRole,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

// ============================================================================
// Plans
// ============================================================================

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn plan(&self, id: &str) -> StoreResult<Option<RebalancePlan>>;

    async fn insert_plan(&self, plan: &RebalancePlan) -> StoreResult<()>;

    /// Compare-and-set status transition; false when the current status is
    /// not in `from`.
    async fn transition_plan(
        &self,
        id: &str,
        from: &[PlanStatus],
        to: PlanStatus,
    ) -> StoreResult<bool>;

    async fn set_plan_ticket(&self, id: &str, ticket_id: &str) -> StoreResult<()>;

    async fn append_action_result(
        &self,
        id: &str,
        result: &keel_core::ActionResult,
    ) -> StoreResult<()>;
}

// ============================================================================
// Risk
// ============================================================================

#[async_trait]
pub trait RiskStore: Send + Sync {
    async fn append_snapshot(&self, snapshot: &RiskSnapshot) -> StoreResult<()>;

    /// Most recent snapshots, newest first.
    async fn recent_snapshots(&self, limit: i64) -> StoreResult<Vec<RiskSnapshot>>;

    async fn append_risk_event(&self, event: &RiskEvent) -> StoreResult<()>;
}

// ============================================================================
// Audit & checkpoints
// ============================================================================

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(&self, contract: Address) -> StoreResult<Option<Checkpoint>>;

    /// Persist a checkpoint. `last_confirmed_block` is non-decreasing: writes
    /// below the stored block are rejected with `Conflict`.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;
}

/// The full store surface the node wires the engines with.
pub trait Store:
    ProjectionStore
    + RedemptionStore
    + TicketStore
    + PlanStore
    + RiskStore
    + AuditStore
    + CheckpointStore
{
}

impl<T> Store for T where
    T: ProjectionStore
        + RedemptionStore
        + TicketStore
        + PlanStore
        + RiskStore
        + AuditStore
        + CheckpointStore
{
}

// ============================================================================
// Coordination KV
// ============================================================================

/// Processed-event set with TTL. Fast first line of replay defense; the
/// `event_processed` table is the durable second line.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically mark the key; true when it was new.
    async fn check_and_mark(&self, key: EventKey, ttl_secs: u64) -> StoreResult<bool>;
}

/// Distributed lease on a well-known key, compare-and-set + TTL semantics.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease; true when this holder now owns it.
    async fn acquire(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Renew; false when the lease is held by someone else (or expired and
    /// taken).
    async fn renew(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Release if still held by `holder`.
    async fn release(&self, key: &str, holder: &str) -> StoreResult<()>;
}
