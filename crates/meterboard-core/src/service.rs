//! Service wiring
//!
//! `Meter` owns one instance of every component and hands out shared
//! references. The HTTP layer and the CLI only talk to this type.

use crate::config::MeterConfig;
use crate::devices::DeviceTracker;
use crate::directory::Directory;
use crate::eligibility::EligibilityFilter;
use crate::error::{CoreError, Result};
use crate::ingest::IngestPipeline;
use crate::jobs::Scheduler;
use crate::metrics::{InMemoryMetrics, MetricsSink};
use crate::models::{Node, NodeId};
use crate::multiplier::MultiplierCalculator;
use crate::node_config::runtime_config;
use crate::period::{PeriodCalendar, PeriodManager};
use crate::store::SqliteStore;
use anyhow::Context;
use chrono::{DateTime, Utc};
use meterboard_types::{NodeRuntimeConfig, NodeStatusReport, NodeUsersResponse};
use std::sync::Arc;
use tracing::{debug, info};

/// The metering core, fully wired
pub struct Meter {
    config: MeterConfig,
    store: Arc<SqliteStore>,
    directory: Arc<dyn Directory>,
    metrics: Arc<dyn MetricsSink>,
    periods: Arc<PeriodManager>,
    multipliers: MultiplierCalculator,
    ingest: IngestPipeline,
    devices: Arc<DeviceTracker>,
    eligibility: EligibilityFilter,
}

impl Meter {
    /// Wire components around an existing ledger and catalog
    pub fn new(
        config: MeterConfig,
        store: Arc<SqliteStore>,
        directory: Arc<dyn Directory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let timeout = config.ingest.transaction_timeout();
        let calendar = PeriodCalendar::from_config(&config.calendar)?;
        let periods = Arc::new(PeriodManager::new(
            calendar,
            Arc::clone(&store),
            Arc::clone(&directory),
            timeout,
        ));
        let ingest = IngestPipeline::new(
            Arc::clone(&directory),
            Arc::clone(&store),
            Arc::clone(&periods),
            Arc::clone(&metrics),
            config.ingest.clone(),
        );
        let devices = Arc::new(DeviceTracker::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.devices.stale_after(),
            timeout,
        ));

        Ok(Self {
            multipliers: MultiplierCalculator::new(Arc::clone(&directory)),
            eligibility: EligibilityFilter::new(Arc::clone(&directory), Arc::clone(&store)),
            config,
            store,
            directory,
            metrics,
            periods,
            ingest,
            devices,
        })
    }

    /// Open the configured database and use it as both ledger and catalog
    pub fn open(config: MeterConfig) -> anyhow::Result<Self> {
        let path = config
            .resolved_database_path()
            .context("No database path configured and no platform data directory")?;
        let store = Arc::new(SqliteStore::open(&path)?);
        info!(path = %path.display(), "Opened ledger");
        Self::with_store(config, store)
    }

    /// Throwaway in-memory instance
    pub fn in_memory(config: MeterConfig) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open_in_memory()?);
        Self::with_store(config, store)
    }

    fn with_store(config: MeterConfig, store: Arc<SqliteStore>) -> anyhow::Result<Self> {
        let directory: Arc<dyn Directory> = store.clone();
        let metrics: Arc<dyn MetricsSink> = Arc::new(InMemoryMetrics::new());
        Self::new(config, store, directory, metrics).context("Invalid configuration")
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn periods(&self) -> &Arc<PeriodManager> {
        &self.periods
    }

    pub fn multipliers(&self) -> &MultiplierCalculator {
        &self.multipliers
    }

    pub fn ingest(&self) -> &IngestPipeline {
        &self.ingest
    }

    pub fn devices(&self) -> &Arc<DeviceTracker> {
        &self.devices
    }

    pub fn eligibility(&self) -> &EligibilityFilter {
        &self.eligibility
    }

    pub fn node(&self, node_id: NodeId) -> Result<Node> {
        self.directory.node(node_id)
    }

    /// Runtime config document for a node
    pub fn runtime_config(&self, node: &Node) -> NodeRuntimeConfig {
        runtime_config(node, &self.config.node)
    }

    /// Authorized-subscriber list for a node
    pub fn authorized_users(&self, node_id: NodeId, now: DateTime<Utc>) -> Result<NodeUsersResponse> {
        let users = self.eligibility.authorized_subscribers(node_id, now)?;
        Ok(NodeUsersResponse { users })
    }

    /// Accept a node load report and mark the node as seen
    pub fn record_status(
        &self,
        node_id: NodeId,
        report: &NodeStatusReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        report
            .validate()
            .map_err(|message| CoreError::MalformedBatch { message })?;
        self.directory.touch_node(node_id, now)?;
        debug!(
            node_id,
            cpu = report.cpu,
            mem_used = report.mem.used,
            mem_total = report.mem.total,
            "Node status received"
        );
        Ok(())
    }

    /// Start the background sweeps
    pub fn start_jobs(&self) -> Scheduler {
        Scheduler::start(
            Arc::clone(&self.periods),
            Arc::clone(&self.devices),
            Arc::clone(&self.metrics),
            &self.config.jobs,
        )
    }

    /// Prometheus exposition of the metrics sink (empty if it keeps no state)
    pub fn render_metrics(&self) -> String {
        self.metrics.render_prometheus().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures;
    use meterboard_types::ResourceUsage;

    fn meter() -> Meter {
        let mut config = MeterConfig::default();
        config.calendar.utc_offset = Some("Z".to_string());
        Meter::in_memory(config).unwrap()
    }

    #[test]
    fn test_status_touches_node() {
        let meter = meter();
        meter.store().put_node(&fixtures::node(1, 1.0, vec![])).unwrap();

        let report = NodeStatusReport {
            cpu: 12.0,
            mem: ResourceUsage { total: 10, used: 5 },
            swap: ResourceUsage::default(),
            disk: ResourceUsage::default(),
        };
        let now = Utc::now();
        meter.record_status(1, &report, now).unwrap();
        assert!(meter.node(1).unwrap().last_seen_at.is_some());

        let bad = NodeStatusReport { cpu: -1.0, ..report.clone() };
        assert!(matches!(
            meter.record_status(1, &bad, now),
            Err(CoreError::MalformedBatch { .. })
        ));
        assert!(matches!(
            meter.record_status(2, &report, now),
            Err(CoreError::NodeNotFound { node_id: 2 })
        ));
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = MeterConfig::default();
        config.calendar.week_starts_on = "someday".to_string();
        assert!(Meter::in_memory(config).is_err());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeterConfig {
            database_path: Some(dir.path().join("meter.db")),
            ..Default::default()
        };
        let meter = Meter::open(config).unwrap();
        assert!(meter.store().path().is_some());
        assert!(meter.render_metrics().is_empty());
    }
}
