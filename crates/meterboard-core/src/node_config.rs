//! Runtime configuration served to relay nodes

use crate::config::NodeProtocolConfig;
use crate::models::Node;
use meterboard_types::{BaseConfig, NodeRuntimeConfig};
use serde_json::{Map, Value};
use tracing::debug;

/// Build the runtime config for `node`.
///
/// `network`, `tls`, `networkSettings` and `routes` are lifted from the
/// node's protocol config when present. An empty or unparsable protocol
/// config yields the base document.
pub fn runtime_config(node: &Node, protocol: &NodeProtocolConfig) -> NodeRuntimeConfig {
    let mut config = NodeRuntimeConfig {
        protocol: node.node_type.clone(),
        listen_ip: protocol.listen_ip.clone(),
        server_port: node.port,
        network: None,
        network_settings: None,
        tls: None,
        base_config: BaseConfig {
            push_interval: protocol.push_interval_secs,
            pull_interval: protocol.pull_interval_secs,
        },
        routes: Vec::new(),
    };

    let Some(fields) = protocol_fields(node) else {
        return config;
    };

    config.network = fields.get("network").and_then(Value::as_str).map(str::to_string);
    config.tls = fields.get("tls").and_then(tls_mode);
    config.network_settings = fields
        .get("networkSettings")
        .or_else(|| fields.get("network_settings"))
        .filter(|v| v.is_object())
        .cloned();
    if let Some(Value::Array(routes)) = fields.get("routes") {
        config.routes = routes.clone();
    }

    config
}

fn protocol_fields(node: &Node) -> Option<Map<String, Value>> {
    let raw = node.protocol_config.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => Some(fields),
        Ok(_) => {
            debug!(node_id = node.id, "Protocol config is not an object, ignoring");
            None
        }
        Err(e) => {
            debug!(node_id = node.id, error = %e, "Unparsable protocol config, ignoring");
            None
        }
    }
}

/// `tls` may be stored as 0/1/2 or as a boolean
fn tls_mode(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(enabled) => Some(i64::from(*enabled)),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}
