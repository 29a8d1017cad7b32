//! Persistence for the keel control plane.
//!
//! Three surfaces:
//! - `Store`: the transactional projection/entity store (Postgres in
//!   production, `MemoryStore` in tests)
//! - `DedupStore` / `LeaseStore`: the coordination KV (Redis in production)
//! - `create_pool`: standardized Postgres pool construction

pub mod error;
pub mod kv;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod ticket_logic;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use kv::RedisKv;
pub use memory::MemoryStore;
pub use pool::{create_pool, DbPoolConfig};
pub use postgres::PgStore;
pub use ticket_logic::apply_ticket_action;
pub use traits::{
    AuditEntry, AuditStore, Checkpoint, CheckpointStore, CommitOutcome, DedupStore, FlowDelta,
    FlowRates, Holding, HoldingDelta, LeaseStore, PlanStore, ProjectionStore, ProjectionUpdate,
    RedemptionStats, RedemptionStore, RiskStore, Store, TicketActOutcome, TicketStore,
};
