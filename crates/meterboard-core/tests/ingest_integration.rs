//! End-to-end ingestion against an on-disk ledger

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use meterboard_core::models::{
    Node, NodeStatus, PeriodBounds, Plan, ResetCadence, Subscriber, UsageCounters,
};
use meterboard_core::{Meter, MeterConfig, PeriodTransition};
use serde_json::json;
use std::collections::HashMap;

fn plan(id: u64, quota_bytes: u64) -> Plan {
    Plan {
        id,
        name: format!("plan-{id}"),
        quota_bytes,
        reset_cadence: ResetCadence::Monthly,
        base_multiplier: 1.0,
        labels: vec![1],
        label_multipliers: HashMap::from([(1, 1.5)]),
        speed_limit: Some(100),
        device_limit: None,
    }
}

fn node(id: u64, multiplier: f64) -> Node {
    Node {
        id,
        name: format!("edge-{id}"),
        node_type: "trojan".to_string(),
        port: 443,
        protocol_config: String::new(),
        multiplier,
        labels: vec![1],
        status: NodeStatus::Active,
        last_seen_at: None,
    }
}

fn subscriber(id: u64) -> Subscriber {
    Subscriber {
        id,
        uuid: Some(format!("uuid-{id}")),
        plan_id: Some(1),
        banned: false,
    }
}

/// Two nodes (x1.0 and x2.0), one plan with a x1.5 label override, 3 subscribers
fn meter(dir: &tempfile::TempDir, quota_bytes: u64) -> Meter {
    let mut config = MeterConfig {
        database_path: Some(dir.path().join("ledger.db")),
        ..Default::default()
    };
    config.calendar.utc_offset = Some("Z".to_string());

    let meter = Meter::open(config).unwrap();
    let store = meter.store();
    store.put_plan(&plan(1, quota_bytes)).unwrap();
    store.put_node(&node(1, 1.0)).unwrap();
    store.put_node(&node(2, 2.0)).unwrap();
    for id in 1..=3 {
        store.put_subscriber(&subscriber(id)).unwrap();
    }
    meter
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_share_one_period() {
    let dir = tempfile::tempdir().unwrap();
    let meter = meter(&dir, 1 << 40);
    let now = Utc::now();

    let batch = json!([[1, [1000, 3000]], [2, [10, 10]], [3, [7, 0]]]);
    let ingest = meter.ingest();
    let (a, b) = tokio::join!(
        ingest.ingest_at(1, batch.clone(), now),
        ingest.ingest_at(2, batch.clone(), now)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_clean() && b.is_clean());

    let store = meter.store();
    for id in 1..=3 {
        assert_eq!(store.read(|l| l.count_current_periods(id)).unwrap(), 1);
    }

    // Aggregate equals the sum of the node breakdown
    let period = store.read(|l| l.current_period(1)).unwrap().unwrap();
    let nodes = store.read(|l| l.node_usage(period.id)).unwrap();
    assert_eq!(nodes.len(), 2);
    let mut sum = UsageCounters::default();
    for usage in &nodes {
        sum.add(&usage.counters);
    }
    assert_eq!(sum, period.counters);

    // 1.5 on node 1, 3.0 on node 2
    assert_eq!(period.counters.real_up, 2000);
    assert_eq!(period.counters.billable_up, 1500 + 3000);
    assert_eq!(period.counters.billable_down, 4500 + 9000);
}

#[tokio::test]
async fn test_exhausted_subscriber_leaves_the_user_list() {
    let dir = tempfile::tempdir().unwrap();
    let meter = meter(&dir, 1_000);
    let now = Utc::now();

    let before = meter.authorized_users(1, now).unwrap();
    assert_eq!(before.users.len(), 3);
    assert_eq!(before.users[0].speed_limit, 100);
    assert_eq!(before.users[0].device_limit, 0);

    // 400 real bytes on a x3.0 route is 1200 billable
    let outcome = meter
        .ingest()
        .ingest_at(2, json!({"2": [400, 0]}), now)
        .await
        .unwrap();
    assert_eq!(outcome.applied, 1);

    let after = meter.authorized_users(1, now).unwrap();
    let ids: Vec<u64> = after.users.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn test_malformed_and_ineligible_items_do_not_fail_the_push() {
    let dir = tempfile::tempdir().unwrap();
    let meter = meter(&dir, 1 << 30);
    meter.store().set_banned(3, true).unwrap();
    let now = Utc::now();

    let outcome = meter
        .ingest()
        .ingest_at(1, json!([["x", [1, 1]], [1, [5]], [3, [9, 9]], [42, [1, 1]]]), now)
        .await
        .unwrap();

    assert_eq!(outcome.received, 4);
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.malformed, 2);
    assert_eq!(outcome.rejected, 2);
    assert!(!outcome.has_fatal());
    assert!(meter.store().read(|l| l.current_period(3)).unwrap().is_none());
}

#[tokio::test]
async fn test_push_after_period_end_rolls_over() {
    let dir = tempfile::tempdir().unwrap();
    let meter = meter(&dir, 1 << 30);
    let january = Utc.with_ymd_and_hms(2025, 1, 20, 8, 0, 0).unwrap();

    let first = meter
        .ingest()
        .apply_report(
            &meter.node(1).unwrap(),
            &meterboard_core::models::TrafficReport {
                subscriber_id: 1,
                upload: 100,
                download: 100,
            },
            january,
        )
        .unwrap();
    assert_eq!(first.transition, PeriodTransition::Opened);

    let february = january + ChronoDuration::days(15);
    let outcome = meter
        .ingest()
        .ingest_at(1, json!([[1, [10, 20]]]), february)
        .await
        .unwrap();
    assert!(outcome.is_clean());

    let store = meter.store();
    let current = store.read(|l| l.current_period(1)).unwrap().unwrap();
    assert_eq!(
        current.bounds,
        PeriodBounds {
            start: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        }
    );
    assert_eq!(current.counters.real_up, 10);

    let closed = store.read(|l| l.period(first.period_id)).unwrap().unwrap();
    assert!(!closed.is_current);
    assert_eq!(closed.counters.real_up, 100);

    let history = meter.periods().history(1, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_current);
}

#[tokio::test]
async fn test_unknown_node_fails_the_push() {
    let dir = tempfile::tempdir().unwrap();
    let meter = meter(&dir, 1 << 30);
    let err = meter
        .ingest()
        .ingest(99, json!([[1, [1, 1]]]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
