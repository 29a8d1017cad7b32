//! Rebalance engine for the keel control plane.
//!
//! Trigger evaluation, plan generation, a simulation gate that fails plans
//! before any write, and an executor with partial-failure semantics (chain
//! transactions are never rolled back automatically).

pub mod engine;
pub mod error;
pub mod executor;
pub mod planner;
pub mod simulator;
pub mod triggers;

pub use engine::{CheckOutcome, RebalanceEngine};
pub use error::{RebalanceError, RebalanceResult};
pub use executor::{Executor, ExecutorConfig};
pub use planner::{Planner, PlannerConfig};
pub use simulator::{asset_tier, project_state, Simulator, DRIFT_TOLERANCE};
pub use triggers::TriggerEvaluator;
