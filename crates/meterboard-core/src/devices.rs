//! Online device tracking
//!
//! Nodes report which addresses each subscriber is connected from. A sighting
//! is keyed by (subscriber, node, address); the device count is the number of
//! distinct addresses across all nodes among sightings newer than the
//! staleness horizon.

use crate::error::{CoreError, Result};
use crate::metrics::{names, MetricsSink};
use crate::models::{NodeId, OnlineDeviceRecord, SubscriberId};
use crate::store::SqliteStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Strip the node qualifier nodes append (`"1.2.3.4_5"` -> `"1.2.3.4"`)
pub fn normalize_address(raw: &str) -> Option<&str> {
    let address = raw.trim();
    let address = match address.split_once('_') {
        Some((address, _qualifier)) => address,
        None => address,
    };
    (!address.is_empty()).then_some(address)
}

/// Result of one alive push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliveOutcome {
    pub recorded: usize,
    pub skipped: usize,
}

pub struct DeviceTracker {
    store: Arc<SqliteStore>,
    metrics: Arc<dyn MetricsSink>,
    stale_after: Duration,
    timeout: Duration,
}

impl DeviceTracker {
    pub fn new(
        store: Arc<SqliteStore>,
        metrics: Arc<dyn MetricsSink>,
        stale_after: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            stale_after,
            timeout,
        }
    }

    /// Oldest `last_seen` still counted as online at `now`
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now - stale_after
    }

    pub fn record_alive(
        &self,
        subscriber_id: SubscriberId,
        node_id: NodeId,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let address = normalize_address(address).ok_or_else(|| CoreError::MalformedBatch {
            message: format!("empty address for subscriber {subscriber_id}"),
        })?;
        self.store.transaction("record alive", self.timeout, |ledger| {
            ledger.upsert_device(subscriber_id, node_id, address, now)
        })
    }

    /// Record every address of an alive push in one transaction
    pub fn record_batch(
        &self,
        node_id: NodeId,
        alive: &BTreeMap<SubscriberId, Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<AliveOutcome> {
        let outcome = self.store.transaction("record alive batch", self.timeout, |ledger| {
            let mut outcome = AliveOutcome::default();
            for (subscriber_id, addresses) in alive {
                for raw in addresses {
                    match normalize_address(raw) {
                        Some(address) => {
                            ledger.upsert_device(*subscriber_id, node_id, address, now)?;
                            outcome.recorded += 1;
                        }
                        None => outcome.skipped += 1,
                    }
                }
            }
            Ok(outcome)
        })?;

        debug!(
            node_id,
            subscribers = alive.len(),
            recorded = outcome.recorded,
            skipped = outcome.skipped,
            "Recorded alive push"
        );
        Ok(outcome)
    }

    pub fn device_count(&self, subscriber_id: SubscriberId, now: DateTime<Utc>) -> Result<u32> {
        let since = self.horizon(now);
        self.store
            .read(|ledger| ledger.distinct_device_count(subscriber_id, since))
    }

    /// Live device count for every subscriber with at least one device
    pub fn all_device_counts(&self, now: DateTime<Utc>) -> Result<BTreeMap<SubscriberId, u32>> {
        let since = self.horizon(now);
        let counts = self
            .store
            .read(|ledger| ledger.all_distinct_device_counts(since))?;

        let total: u64 = counts.values().map(|c| u64::from(*c)).sum();
        self.metrics
            .set_gauge(names::ONLINE_DEVICES, &[], total as f64);
        Ok(counts)
    }

    pub fn devices(&self, subscriber_id: SubscriberId) -> Result<Vec<OnlineDeviceRecord>> {
        self.store.read(|ledger| ledger.devices_for(subscriber_id))
    }

    /// Delete sightings older than the horizon
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = self.horizon(now);
        let removed = self.store.transaction("sweep stale devices", self.timeout, |ledger| {
            ledger.delete_devices_before(cutoff)
        })?;

        if removed > 0 {
            self.metrics
                .increment_by(names::STALE_DEVICES_REMOVED_TOTAL, &[], removed as u64);
            info!(removed, cutoff = %cutoff, "Removed stale device sightings");
        }
        Ok(removed)
    }
}
