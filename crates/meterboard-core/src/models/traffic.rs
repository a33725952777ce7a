use super::catalog::{NodeId, SubscriberId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw traffic one subscriber consumed on the reporting node since its last push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub subscriber_id: SubscriberId,
    pub upload: u64,
    pub download: u64,
}

/// Liveness sighting of a subscriber address on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineDeviceRecord {
    pub subscriber_id: SubscriberId,
    pub node_id: NodeId,
    pub address: String,
    pub last_seen: DateTime<Utc>,
}
