//! Event dispatcher and projection handlers for the keel control plane.
//!
//! Decoded events become projection writes (fund row, redemption requests,
//! holdings, NAV series) plus typed `DomainEffect`s the node routes to the
//! approval, rebalance, and risk engines. All writes for one event commit in
//! a single transaction with the `event_processed` row.

pub mod dispatcher;
pub mod effects;
pub mod error;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use effects::DomainEffect;
pub use error::{ProjectionError, ProjectionResult};
