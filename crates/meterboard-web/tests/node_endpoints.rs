//! Integration tests for the node-facing endpoints

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use meterboard_core::models::{Node, NodeStatus, Plan, ResetCadence, Subscriber};
use meterboard_core::{Meter, MeterConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "node-secret";

fn meter() -> Arc<Meter> {
    let mut config = MeterConfig::default();
    config.node.server_token = TOKEN.to_string();
    config.calendar.utc_offset = Some("Z".to_string());
    let meter = Meter::in_memory(config).unwrap();

    let store = meter.store();
    store
        .put_plan(&Plan {
            id: 1,
            name: "basic".to_string(),
            quota_bytes: 10_000,
            reset_cadence: ResetCadence::Monthly,
            base_multiplier: 1.0,
            labels: vec![1],
            label_multipliers: HashMap::new(),
            speed_limit: None,
            device_limit: Some(3),
        })
        .unwrap();
    store
        .put_node(&Node {
            id: 1,
            name: "edge-1".to_string(),
            node_type: "vmess".to_string(),
            port: 443,
            protocol_config: r#"{"network":"ws","tls":1}"#.to_string(),
            multiplier: 2.0,
            labels: vec![1],
            status: NodeStatus::Active,
            last_seen_at: None,
        })
        .unwrap();
    for id in [1, 2] {
        store
            .put_subscriber(&Subscriber {
                id,
                uuid: Some(format!("uuid-{id}")),
                plan_id: Some(1),
                banned: false,
            })
            .unwrap();
    }

    Arc::new(meter)
}

fn uri(path: &str) -> String {
    format!("/api/v1/server/UniProxy/{path}?token={TOKEN}&node_id=1&node_type=v2ray")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

#[tokio::test]
async fn test_authentication() {
    let router = meterboard_web::create_router(meter());

    let (status, _) = send(&router, get("/api/v1/server/UniProxy/user?token=nope&node_id=1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&router, get(&format!("/api/v1/server/UniProxy/user?token={TOKEN}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get(&format!("/api/v1/server/UniProxy/user?token={TOKEN}&node_id=9"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &router,
        get(&format!("/api/v1/server/UniProxy/user?token={TOKEN}&node_id=1&node_type=trojan")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "node type mismatch");
}

#[tokio::test]
async fn test_user_list_supports_conditional_requests() {
    let router = meterboard_web::create_router(meter());

    let response = router.clone().oneshot(get(&uri("user"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        body,
        json!({"users": [
            {"id": 1, "uuid": "uuid-1", "speed_limit": 0, "device_limit": 3},
            {"id": 2, "uuid": "uuid-2", "speed_limit": 0, "device_limit": 3}
        ]})
    );

    let conditional = Request::builder()
        .uri(uri("user"))
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(conditional).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[header::ETAG], etag.as_str());
}

#[tokio::test]
async fn test_config_document() {
    let router = meterboard_web::create_router(meter());

    let (status, body) = send(&router, get("/api/v2/server/config?token=node-secret&node_id=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "vmess");
    assert_eq!(body["server_port"], 443);
    assert_eq!(body["network"], "ws");
    assert_eq!(body["tls"], 1);
    assert_eq!(body["base_config"], json!({"push_interval": 60, "pull_interval": 60}));
}

#[tokio::test]
async fn test_push_applies_and_exhausts_quota() {
    let meter = meter();
    let router = meterboard_web::create_router(Arc::clone(&meter));

    let (status, body) = send(&router, post(&uri("push"), r#"{"1": [3000, 2500], "7": [1, 1]}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"code": 0, "message": "ok", "data": true}));

    // 5500 real bytes at x2.0 exceed the 10 000 byte quota
    let (_, body) = send(&router, get(&uri("user"))).await;
    let ids: Vec<u64> = body["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![2]);

    let (status, body) = send(&router, post(&uri("push"), "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"code": 422, "message": "Invalid data format"}));

    // Decodable but not a batch: acknowledged, nothing applied
    for scalar in ["42", "null", "\"x\"", "true"] {
        let (status, body) = send(&router, post(&uri("push"), scalar)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"code": 0, "message": "ok", "data": true}));
    }
}

#[tokio::test]
async fn test_alive_and_alivelist() {
    let router = meterboard_web::create_router(meter());

    let (status, body) = send(
        &router,
        post(&uri("alive"), r#"{"1": ["1.1.1.1_1", "2.2.2.2_1"], "2": ["3.3.3.3_1"]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": true}));

    let (status, body) = send(&router, get(&uri("alivelist"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"alive": {"1": 2, "2": 1}}));
}

#[tokio::test]
async fn test_status_report() {
    let meter = meter();
    let router = meterboard_web::create_router(Arc::clone(&meter));

    let (status, body) = send(
        &router,
        post(&uri("status"), r#"{"cpu": 5.5, "mem": {"total": 100, "used": 10}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "success");
    assert!(meter.node(1).unwrap().last_seen_at.is_some());

    let (status, _) = send(&router, post(&uri("status"), r#"{"cpu": 500.0, "mem": {"total": 1, "used": 1}}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let meter = meter();
    let router = meterboard_web::create_router(Arc::clone(&meter));

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    send(&router, post(&uri("push"), r#"[[1, [10, 10]]]"#)).await;
    let (status, body) = send(&router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("traffic_reports_total{node_id=\"1\"} 1"));
}
