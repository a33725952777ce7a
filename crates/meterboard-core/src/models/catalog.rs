//! Plan, node and subscriber records as read from the directory
//!
//! These are owned by the account/catalog subsystem; the metering core only
//! reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub type SubscriberId = u64;
pub type PlanId = u64;
pub type NodeId = u64;
pub type LabelId = u64;

/// Factor applied when nothing marks traffic up or down
pub const NEUTRAL_MULTIPLIER: f64 = 1.0;

/// How often a plan's accounting period resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetCadence {
    /// Never resets (one period spanning a century)
    None,
    Daily,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl ResetCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetCadence::None => "none",
            ResetCadence::Daily => "daily",
            ResetCadence::Weekly => "weekly",
            ResetCadence::Monthly => "monthly",
            ResetCadence::Yearly => "yearly",
        }
    }
}

impl fmt::Display for ResetCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetCadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ResetCadence::None),
            "daily" => Ok(ResetCadence::Daily),
            "weekly" => Ok(ResetCadence::Weekly),
            "monthly" => Ok(ResetCadence::Monthly),
            "yearly" => Ok(ResetCadence::Yearly),
            other => Err(format!("unknown reset cadence: {other}")),
        }
    }
}

/// Subscription plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Billable bytes allowed per period
    pub quota_bytes: u64,
    pub reset_cadence: ResetCadence,
    pub base_multiplier: f64,
    /// Labels granting access to nodes carrying the same label
    pub labels: Vec<LabelId>,
    /// Per-label multiplier overrides; labels absent here are neutral
    #[serde(default)]
    pub label_multipliers: HashMap<LabelId, f64>,
    /// Published speed limit in Mbps (None = unlimited)
    #[serde(default)]
    pub speed_limit: Option<u64>,
    /// Published concurrent device limit (None = unlimited)
    #[serde(default)]
    pub device_limit: Option<u32>,
}

impl Plan {
    /// Multiplier this plan applies to traffic on a node carrying `label`
    pub fn label_multiplier(&self, label: LabelId) -> f64 {
        match self.label_multipliers.get(&label) {
            Some(multiplier) => *multiplier,
            None => NEUTRAL_MULTIPLIER,
        }
    }

    /// True if the plan shares at least one label with `labels`
    pub fn shares_label(&self, labels: &[LabelId]) -> bool {
        self.labels.iter().any(|l| labels.contains(l))
    }
}

/// Operational status of a relay node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Maintenance => "maintenance",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "inactive" => Ok(NodeStatus::Inactive),
            "maintenance" => Ok(NodeStatus::Maintenance),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// Relay node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Protocol served by the node (vmess, trojan, hysteria, ...)
    pub node_type: String,
    pub port: u16,
    /// Raw protocol-specific JSON document, may be empty
    #[serde(default)]
    pub protocol_config: String,
    /// Always positive
    pub multiplier: f64,
    pub labels: Vec<LabelId>,
    pub status: NodeStatus,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Subscriber as seen by the metering core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    /// Credential published to nodes; subscribers without one are never served
    pub uuid: Option<String>,
    pub plan_id: Option<PlanId>,
    pub banned: bool,
}
