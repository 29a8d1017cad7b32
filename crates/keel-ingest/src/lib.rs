//! Event ingestion for the keel control plane.
//!
//! The ingestor is a lease-guarded singleton that fetches, confirms,
//! deduplicates, and enqueues chain events with per-contract ordering. The
//! polling loop is authoritative; the WS subscription is a latency
//! optimization. Reorgs past the confirmation depth halt ingestion and page
//! an operator; there is no auto-heal.

pub mod checkpoint;
pub mod error;
pub mod ingestor;

pub use checkpoint::{CheckpointTracker, FlushPolicy};
pub use error::{IngestError, IngestResult};
pub use ingestor::{
    IngestAlert, IngestCommand, IngestConfig, IngestStats, Ingestor, INGESTOR_LEASE_KEY,
};
