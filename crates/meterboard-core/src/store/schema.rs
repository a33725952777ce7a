//! SQLite schema
//!
//! Timestamps are unix seconds (UTC). Byte counters are stored as INTEGER
//! and read back as u64.
//!
//! Schema Version History:
//! - v1: catalog tables, periods, node usage, online devices
//! - v2: partial unique index enforcing one current period per subscriber
//! - v3: closed_at on periods, last_seen_at on nodes

/// Current schema version
///
/// A database created by a different version is refused rather than cleared:
/// it holds billing data.
pub const SCHEMA_VERSION: i32 = 3;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS plans (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    quota_bytes INTEGER NOT NULL DEFAULT 0,
    reset_cadence TEXT NOT NULL DEFAULT 'monthly',
    base_multiplier REAL NOT NULL DEFAULT 1.0,
    speed_limit INTEGER,
    device_limit INTEGER
);

CREATE TABLE IF NOT EXISTS plan_labels (
    plan_id INTEGER NOT NULL,
    label_id INTEGER NOT NULL,
    PRIMARY KEY (plan_id, label_id)
);

CREATE TABLE IF NOT EXISTS plan_label_multipliers (
    plan_id INTEGER NOT NULL,
    label_id INTEGER NOT NULL,
    multiplier REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (plan_id, label_id)
);

CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    port INTEGER NOT NULL,
    protocol_config TEXT NOT NULL DEFAULT '',
    multiplier REAL NOT NULL DEFAULT 1.0 CHECK (multiplier > 0),
    status TEXT NOT NULL DEFAULT 'active',
    last_seen_at INTEGER
);

CREATE TABLE IF NOT EXISTS node_labels (
    node_id INTEGER NOT NULL,
    label_id INTEGER NOT NULL,
    PRIMARY KEY (node_id, label_id)
);

CREATE TABLE IF NOT EXISTS subscribers (
    id INTEGER PRIMARY KEY,
    uuid TEXT UNIQUE,
    plan_id INTEGER,
    banned INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_subscribers_plan ON subscribers(plan_id);

CREATE TABLE IF NOT EXISTS accounting_periods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subscriber_id INTEGER NOT NULL,
    plan_id INTEGER NOT NULL,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    real_up INTEGER NOT NULL DEFAULT 0,
    real_down INTEGER NOT NULL DEFAULT 0,
    billable_up INTEGER NOT NULL DEFAULT 0,
    billable_down INTEGER NOT NULL DEFAULT 0,
    is_current INTEGER NOT NULL DEFAULT 1,
    closed_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_current_period
    ON accounting_periods(subscriber_id) WHERE is_current = 1;
CREATE INDEX IF NOT EXISTS idx_periods_subscriber
    ON accounting_periods(subscriber_id, period_start);
CREATE INDEX IF NOT EXISTS idx_periods_current_end
    ON accounting_periods(period_end) WHERE is_current = 1;

CREATE TABLE IF NOT EXISTS node_usage (
    subscriber_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    period_id INTEGER NOT NULL,
    real_up INTEGER NOT NULL DEFAULT 0,
    real_down INTEGER NOT NULL DEFAULT 0,
    billable_up INTEGER NOT NULL DEFAULT 0,
    billable_down INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (subscriber_id, node_id, period_id)
);

CREATE INDEX IF NOT EXISTS idx_node_usage_period ON node_usage(period_id);

CREATE TABLE IF NOT EXISTS online_devices (
    subscriber_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    last_seen INTEGER NOT NULL,
    PRIMARY KEY (subscriber_id, node_id, address)
);

CREATE INDEX IF NOT EXISTS idx_online_devices_last_seen ON online_devices(last_seen);
"#;
