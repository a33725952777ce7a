//! Accounting periods and per-node usage counters

use super::catalog::{NodeId, PlanId, SubscriberId};
use chrono::{DateTime, Utc};
use meterboard_types::{NodeUsageSnapshot, UsageSnapshot};
use serde::{Deserialize, Serialize};

pub type PeriodId = u64;

/// The four running counters kept for every period and node breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub real_up: u64,
    pub real_down: u64,
    pub billable_up: u64,
    pub billable_down: u64,
}

impl UsageCounters {
    /// Billable bytes counted against the plan quota
    pub fn billable_total(&self) -> u64 {
        self.billable_up.saturating_add(self.billable_down)
    }

    pub fn real_total(&self) -> u64 {
        self.real_up.saturating_add(self.real_down)
    }

    /// Accumulate another set of deltas
    pub fn add(&mut self, other: &UsageCounters) {
        self.real_up = self.real_up.saturating_add(other.real_up);
        self.real_down = self.real_down.saturating_add(other.real_down);
        self.billable_up = self.billable_up.saturating_add(other.billable_up);
        self.billable_down = self.billable_down.saturating_add(other.billable_down);
    }
}

/// Half-open window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBounds {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// One subscriber's usage window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingPeriod {
    pub id: PeriodId,
    pub subscriber_id: SubscriberId,
    /// Plan in force when the period was opened
    pub plan_id: PlanId,
    pub bounds: PeriodBounds,
    pub counters: UsageCounters,
    pub is_current: bool,
}

impl AccountingPeriod {
    /// A current period whose end has passed must be rolled over before use
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.bounds.end <= now
    }

    pub fn snapshot(&self, quota_bytes: u64, nodes: &[NodeUsage]) -> UsageSnapshot {
        UsageSnapshot {
            subscriber_id: self.subscriber_id,
            period_id: self.id,
            period_start: self.bounds.start,
            period_end: self.bounds.end,
            is_current: self.is_current,
            real_bytes_up: self.counters.real_up,
            real_bytes_down: self.counters.real_down,
            billable_bytes_up: self.counters.billable_up,
            billable_bytes_down: self.counters.billable_down,
            quota_bytes,
            nodes: nodes.iter().map(NodeUsage::snapshot).collect(),
        }
    }
}

/// Breakdown of a period's counters for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsage {
    pub subscriber_id: SubscriberId,
    pub node_id: NodeId,
    pub period_id: PeriodId,
    pub counters: UsageCounters,
}

impl NodeUsage {
    pub fn snapshot(&self) -> NodeUsageSnapshot {
        NodeUsageSnapshot {
            node_id: self.node_id,
            real_bytes_up: self.counters.real_up,
            real_bytes_down: self.counters.real_down,
            billable_bytes_up: self.counters.billable_up,
            billable_bytes_down: self.counters.billable_down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_counters_add_saturates() {
        let mut total = UsageCounters {
            real_up: u64::MAX - 1,
            ..Default::default()
        };
        total.add(&UsageCounters {
            real_up: 10,
            real_down: 5,
            billable_up: 20,
            billable_down: 7,
        });

        assert_eq!(total.real_up, u64::MAX);
        assert_eq!(total.real_down, 5);
        assert_eq!(total.billable_total(), 27);
    }

    #[test]
    fn test_bounds_are_half_open() {
        let bounds = PeriodBounds {
            start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        };

        assert!(bounds.contains(bounds.start));
        assert!(!bounds.contains(bounds.end));
    }
}
