//! Risk engine for the keel control plane.
//!
//! Indicator evaluation with a leveled response, Monte-Carlo liquidity
//! forecasting, and the lease-guarded emergency driver with its recovery
//! watcher.

pub mod emergency;
pub mod error;
pub mod forecast;
pub mod indicators;
pub mod monitor;

pub use emergency::{incident_id_for, EmergencyConfig, EmergencyDriver};
pub use error::{RiskError, RiskResult};
pub use forecast::{ForecastConfig, Forecaster};
pub use indicators::{evaluate, overall_level, score, IndicatorConfig, IndicatorInputs};
pub use monitor::{RiskMonitor, RiskSignal};
