//! Traffic ingestion pipeline
//!
//! A push is normalized once, then each report is applied independently:
//! eligibility check, multiplier, floor to billable bytes, and one ledger
//! transaction that opens or rolls the period and increments both the
//! period aggregate and the node breakdown. Reports run concurrently, bounded
//! by a semaphore. Nothing is retried here: the node resends on its own timer.

mod batch;

pub use batch::{NormalizedBatch, TrafficBatch};

use crate::config::IngestConfig;
use crate::directory::Directory;
use crate::error::{CoreError, ErrorCategory, IngestIssue, IssueSeverity, Result};
use crate::metrics::{names, MetricsSink};
use crate::models::{Node, NodeId, PeriodId, SubscriberId, TrafficReport, UsageCounters};
use crate::multiplier::{self, billable_bytes};
use crate::period::{PeriodManager, PeriodTransition};
use crate::store::SqliteStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// One report that made it into the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedReport {
    pub subscriber_id: SubscriberId,
    pub period_id: PeriodId,
    pub multiplier: f64,
    pub delta: UsageCounters,
    pub transition: PeriodTransition,
}

/// Summary of one push
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Items in the payload, malformed ones included
    pub received: usize,
    pub applied: usize,
    pub malformed: usize,
    /// Dropped for business reasons (banned, no plan, unknown subscriber)
    pub rejected: usize,
    /// Could not be persisted; lost until the node resends
    pub failed: usize,
    pub issues: Vec<IngestIssue>,
}

impl IngestOutcome {
    pub fn has_fatal(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Fatal)
    }

    /// Every received item was applied
    pub fn is_clean(&self) -> bool {
        self.applied == self.received
    }
}

/// Applies traffic pushes to the ledger
#[derive(Clone)]
pub struct IngestPipeline {
    directory: Arc<dyn Directory>,
    store: Arc<SqliteStore>,
    periods: Arc<PeriodManager>,
    metrics: Arc<dyn MetricsSink>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<SqliteStore>,
        periods: Arc<PeriodManager>,
        metrics: Arc<dyn MetricsSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            directory,
            store,
            periods,
            metrics,
            config,
        }
    }

    /// Ingest a raw push from `node_id`
    pub async fn ingest(&self, node_id: NodeId, payload: Value) -> Result<IngestOutcome> {
        self.ingest_at(node_id, payload, Utc::now()).await
    }

    /// Ingest with an explicit clock
    ///
    /// Fails only when the node is unknown. Per-item problems, a scalar
    /// payload included, land in the outcome.
    pub async fn ingest_at(
        &self,
        node_id: NodeId,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let started = Instant::now();

        let directory = Arc::clone(&self.directory);
        let node = Arc::new(blocking(move || directory.node(node_id)).await?);

        let batch = TrafficBatch::from_value(payload);
        let normalized = batch.normalize();

        let mut outcome = IngestOutcome {
            received: batch.len(),
            malformed: normalized.malformed.len(),
            ..Default::default()
        };

        let node_label = node_id.to_string();
        self.metrics.increment_by(
            names::TRAFFIC_REPORTS_TOTAL,
            &[("node_id", node_label.as_str())],
            outcome.received as u64,
        );

        if !normalized.malformed.is_empty() {
            self.metrics.increment_by(
                names::REPORTS_MALFORMED_TOTAL,
                &[],
                normalized.malformed.len() as u64,
            );
            debug!(node_id, count = normalized.malformed.len(), "Skipped malformed items");
            for reason in normalized.malformed {
                outcome.issues.push(IngestIssue::notice("normalize", reason));
            }
        }

        // Bounded concurrency across the reports of this batch
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_reports));
        let mut handles = Vec::with_capacity(normalized.reports.len());

        for report in normalized.reports {
            let sem = Arc::clone(&semaphore);
            let pipeline = self.clone();
            let node = Arc::clone(&node);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| CoreError::TaskFailed {
                    message: e.to_string(),
                })?;
                blocking(move || pipeline.apply_report(&node, &report, now)).await
            });

            handles.push((report.subscriber_id, handle));
        }

        for (subscriber_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(CoreError::TaskFailed {
                    message: format!("Task panic: {e}"),
                }),
            };

            match result {
                Ok(_) => outcome.applied += 1,
                Err(e) => self.record_failure(node_id, subscriber_id, e, &mut outcome),
            }
        }

        let elapsed = started.elapsed();
        self.metrics
            .observe(names::INGEST_BATCH_SECONDS, elapsed.as_secs_f64());

        debug!(
            node_id,
            received = outcome.received,
            applied = outcome.applied,
            malformed = outcome.malformed,
            rejected = outcome.rejected,
            failed = outcome.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Traffic push ingested"
        );

        Ok(outcome)
    }

    /// Apply one report in its own transaction
    pub fn apply_report(
        &self,
        node: &Node,
        report: &TrafficReport,
        now: DateTime<Utc>,
    ) -> Result<AppliedReport> {
        let subscriber_id = report.subscriber_id;
        let subscriber = self.directory.subscriber(subscriber_id)?;
        if subscriber.banned {
            return Err(CoreError::SubscriberBanned { subscriber_id });
        }
        let plan = match subscriber.plan_id {
            Some(plan_id) => self.directory.plan(plan_id)?,
            None => return Err(CoreError::NoPlan { subscriber_id }),
        };

        let multiplier = multiplier::checked(subscriber_id, node, Some(&plan))?;
        let delta = UsageCounters {
            real_up: report.upload,
            real_down: report.download,
            billable_up: billable_bytes(report.upload, multiplier),
            billable_down: billable_bytes(report.download, multiplier),
        };

        let (period_id, transition) = self.store.transaction(
            "apply traffic report",
            self.config.transaction_timeout(),
            |ledger| {
                let (period, transition) =
                    self.periods.ensure_current(ledger, subscriber_id, &plan, now)?;
                ledger.increment_period(period.id, &delta)?;
                ledger.upsert_node_usage(subscriber_id, node.id, period.id, &delta)?;
                Ok((period.id, transition))
            },
        )?;

        self.record_traffic(subscriber_id, &delta);

        Ok(AppliedReport {
            subscriber_id,
            period_id,
            multiplier,
            delta,
            transition,
        })
    }

    fn record_traffic(&self, subscriber_id: SubscriberId, delta: &UsageCounters) {
        let user = subscriber_id.to_string();
        for (direction, kind, bytes) in [
            ("upload", "real", delta.real_up),
            ("download", "real", delta.real_down),
            ("upload", "billable", delta.billable_up),
            ("download", "billable", delta.billable_down),
        ] {
            self.metrics.increment_by(
                names::USER_TRAFFIC_BYTES_TOTAL,
                &[("user_id", user.as_str()), ("direction", direction), ("type", kind)],
                bytes,
            );
        }
    }

    fn record_failure(
        &self,
        node_id: NodeId,
        subscriber_id: SubscriberId,
        err: CoreError,
        outcome: &mut IngestOutcome,
    ) {
        match err.category() {
            ErrorCategory::Ineligible | ErrorCategory::NotFound | ErrorCategory::MalformedInput => {
                outcome.rejected += 1;
                self.metrics.increment(
                    names::REPORTS_REJECTED_TOTAL,
                    &[("reason", rejection_reason(&err))],
                );
                info!(node_id, subscriber_id, reason = %err, "Dropped traffic report");
            }
            ErrorCategory::Invariant => {
                outcome.failed += 1;
                self.metrics.increment(names::ACCOUNTING_ERRORS_TOTAL, &[]);
                error!(node_id, subscriber_id, error = %err, "Ledger consistency alarm");
            }
            ErrorCategory::Persistence | ErrorCategory::Config => {
                outcome.failed += 1;
                self.metrics.increment(names::ACCOUNTING_ERRORS_TOTAL, &[]);
                warn!(node_id, subscriber_id, error = %err, "Failed to apply traffic report");
            }
        }
        outcome
            .issues
            .push(IngestIssue::from_core_error(subscriber_id, &err));
    }
}

fn rejection_reason(err: &CoreError) -> &'static str {
    match err {
        CoreError::SubscriberBanned { .. } => "banned",
        CoreError::NoPlan { .. } => "no_plan",
        CoreError::SubscriberNotFound { .. } => "unknown_subscriber",
        CoreError::PlanNotFound { .. } => "unknown_plan",
        _ => "other",
    }
}

/// Run blocking ledger work off the async executor
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::TaskFailed {
            message: e.to_string(),
        })?
}
