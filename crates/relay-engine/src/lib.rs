//! Relay engine.
//!
//! Wires the source feed, the delivery ledger and the target ledger into a
//! running relay:
//!
//! - [`Ingestor`] records each notification as a `Pending` delivery and
//!   acknowledges it only once the record is durable.
//! - [`DeliveryPipeline`] translates, claims, submits and records the
//!   outcome of one delivery attempt.
//! - [`RetryScheduler`] decides retry times with [`BackoffPolicy`] and marks
//!   records whose attempts ran out.
//! - [`RelayCoordinator`] owns the worker pool and the start, pause,
//!   resume, drain and shutdown lifecycle.
//!
//! Every time-dependent operation takes `now` explicitly; only the
//! coordinator's background loops read the clock.

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod scheduler;
pub mod status;

pub use backoff::BackoffPolicy;
pub use config::{RelayConfig, StoreConfig};
pub use coordinator::RelayCoordinator;
pub use dispatch::{plan_dispatch, Sharder};
pub use error::{RelayError, RelayResult};
pub use ingest::{normalize, IngestOutcome, Ingestor};
pub use pipeline::{DeliveryPipeline, JobOutcome};
pub use scheduler::{RetryScheduler, ScanReport};
pub use status::{
    abandon_record, failure_summaries, DrainReport, FailureSummary, Lifecycle, RecoveryReport,
    RelayStatus,
};
