//! Approval workflow engine for the keel control plane.
//!
//! Declarative rules match incoming requests to an approver requirement and
//! SLA; tickets accumulate approvals under row locks; resolution cancels the
//! SLA timers and hands the result to the on-chain commit or the rebalance
//! engine.

pub mod engine;
pub mod error;
pub mod result;
pub mod rules;
pub mod sla;

pub use engine::{ApprovalEngine, ApprovalRequest, ApproverDirectory, CreatedTicket};
pub use error::{ApprovalError, ApprovalResult};
pub use result::ResultProcessor;
pub use rules::RuleTable;
