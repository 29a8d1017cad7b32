//! Telemetry for the keel control plane: tracing setup and Prometheus
//! metrics.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
