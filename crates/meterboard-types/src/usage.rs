use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of one accounting period, for operators and tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub subscriber_id: u64,
    pub period_id: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub is_current: bool,
    pub real_bytes_up: u64,
    pub real_bytes_down: u64,
    pub billable_bytes_up: u64,
    pub billable_bytes_down: u64,
    /// Plan quota in bytes (0 means the plan grants nothing)
    pub quota_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeUsageSnapshot>,
}

impl UsageSnapshot {
    /// Billable bytes counted against the quota
    pub fn billable_total(&self) -> u64 {
        self.billable_bytes_up.saturating_add(self.billable_bytes_down)
    }

    /// Percentage of quota consumed (clamped to 999.9 for display)
    pub fn quota_used_pct(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 999.9;
        }
        (self.billable_total() as f64 / self.quota_bytes as f64 * 100.0).min(999.9)
    }
}

/// Per-node share of a period's usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsageSnapshot {
    pub node_id: u64,
    pub real_bytes_up: u64,
    pub real_bytes_down: u64,
    pub billable_bytes_up: u64,
    pub billable_bytes_down: u64,
}
