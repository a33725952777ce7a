use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One subscriber a relay node is allowed to serve.
///
/// `speed_limit` (Mbps) and `device_limit` use 0 for "unlimited", which is
/// what relay nodes expect on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUser {
    pub id: u64,
    pub uuid: String,
    pub speed_limit: u64,
    pub device_limit: u32,
}

/// Body of the authorized-subscriber list (`GET user`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsersResponse {
    pub users: Vec<NodeUser>,
}

/// Intervals the node should use when talking back to us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Seconds between traffic pushes
    pub push_interval: u64,
    /// Seconds between user-list pulls
    pub pull_interval: u64,
}

/// Runtime configuration served to a relay node (`GET config`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRuntimeConfig {
    pub protocol: String,
    pub listen_ip: String,
    pub server_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(
        default,
        rename = "networkSettings",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_settings: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<i64>,

    pub base_config: BaseConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<serde_json::Value>,
}

/// Online device counts per subscriber (`GET alivelist`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveList {
    pub alive: BTreeMap<u64, u32>,
}

/// Total/used pair reported for memory, swap and disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub total: u64,
    pub used: u64,
}

/// Load report pushed by a relay node (`POST status`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub cpu: f64,
    pub mem: ResourceUsage,
    #[serde(default)]
    pub swap: ResourceUsage,
    #[serde(default)]
    pub disk: ResourceUsage,
}

impl NodeStatusReport {
    /// Reject reports a node could not have measured
    pub fn validate(&self) -> Result<(), String> {
        if !self.cpu.is_finite() || !(0.0..=100.0).contains(&self.cpu) {
            return Err(format!("cpu out of range: {}", self.cpu));
        }
        Ok(())
    }
}

/// Envelope returned by node write endpoints (`push`, `alive`, `status`).
///
/// Nodes only check that the request was received, so `data` is `true` even
/// when individual items were dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: bool,
}

impl Acknowledgement {
    /// `{"code":0,"message":"<message>","data":true}`
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            message: Some(message.into()),
            data: true,
        }
    }

    /// `{"data":true}`
    pub fn bare() -> Self {
        Self {
            code: None,
            message: None,
            data: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_omits_empty_fields() {
        let config = NodeRuntimeConfig {
            protocol: "vmess".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            server_port: 443,
            network: None,
            network_settings: None,
            tls: None,
            base_config: BaseConfig {
                push_interval: 60,
                pull_interval: 60,
            },
            routes: Vec::new(),
        };

        let json = serde_json::to_value(&config).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("network"));
        assert!(!object.contains_key("networkSettings"));
        assert!(!object.contains_key("tls"));
        assert!(!object.contains_key("routes"));
        assert_eq!(json["base_config"]["push_interval"], 60);
    }

    #[test]
    fn test_alive_list_keys_serialize_as_strings() {
        let mut alive = AliveList::default();
        alive.alive.insert(7, 2);

        let json = serde_json::to_string(&alive).unwrap();
        assert_eq!(json, r#"{"alive":{"7":2}}"#);
    }

    #[test]
    fn test_status_report_validation() {
        let json = r#"{"cpu": 12.5, "mem": {"total": 1024, "used": 512}}"#;
        let report: NodeStatusReport = serde_json::from_str(json).unwrap();
        assert!(report.validate().is_ok());
        assert_eq!(report.swap, ResourceUsage::default());

        let bad = NodeStatusReport {
            cpu: 140.0,
            ..report
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_acknowledgement_shapes() {
        assert_eq!(
            serde_json::to_string(&Acknowledgement::ok("ok")).unwrap(),
            r#"{"code":0,"message":"ok","data":true}"#
        );
        assert_eq!(
            serde_json::to_string(&Acknowledgement::bare()).unwrap(),
            r#"{"data":true}"#
        );
    }
}
