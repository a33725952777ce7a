//! meterboard-core - Metering core for meterboard
//!
//! Turns raw per-node traffic pushes into billable usage and decides which
//! subscribers each relay node may serve.
//!
//! - Billing multipliers (node factor x plan base x matching label overrides)
//! - Accounting periods aligned to a plan's reset cadence
//! - Concurrent traffic ingestion with one transaction per report
//! - Online device tracking with a staleness horizon
//! - Response fingerprints for conditional node pulls
//! - Quota eligibility

pub mod config;
pub mod devices;
pub mod directory;
pub mod eligibility;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod multiplier;
pub mod node_config;
pub mod period;
pub mod service;
pub mod store;

pub use config::MeterConfig;
pub use devices::{normalize_address, AliveOutcome, DeviceTracker};
pub use directory::{Directory, MemoryDirectory};
pub use eligibility::{quota_state, EligibilityFilter, QuotaState};
pub use error::{CoreError, ErrorCategory, IngestIssue, IssueSeverity, Result};
pub use fingerprint::{Conditional, Fingerprint};
pub use ingest::{AppliedReport, IngestOutcome, IngestPipeline, TrafficBatch};
pub use jobs::{run_device_sweep, run_period_sweep, Scheduler};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use multiplier::{billable_bytes, compose_multiplier, MultiplierCalculator};
pub use period::{PeriodCalendar, PeriodManager, PeriodTransition, SweepReport};
pub use service::Meter;
pub use store::SqliteStore;
