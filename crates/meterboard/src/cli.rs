//! Terminal output for the operator commands
//!
//! Every formatter takes a `json` flag; JSON output is meant for scripts and
//! never contains colors.

use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use meterboard_core::{IngestOutcome, IssueSeverity, SweepReport};
use meterboard_types::UsageSnapshot;
use serde_json::json;
use std::collections::BTreeMap;

// ============================================================================
// Tables
// ============================================================================

fn header(table: &mut Table, columns: &[&str], no_color: bool) {
    if no_color {
        table.set_header(columns.to_vec());
    } else {
        table.set_header(
            columns
                .iter()
                .map(|c| Cell::new(c).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
}

/// Period history of one subscriber, newest first
pub fn format_usage(snapshots: &[UsageSnapshot], json: bool, no_color: bool) -> String {
    if json {
        return serde_json::to_string_pretty(snapshots).unwrap_or_else(|_| "[]".to_string());
    }

    if snapshots.is_empty() {
        return "No accounting periods found.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(
        &mut table,
        &["Period", "Start", "End", "State", "Real", "Billable", "Quota", "Used"],
        no_color,
    );

    for s in snapshots {
        let state = if s.is_current { "current" } else { "closed" };
        let real = s.real_bytes_up.saturating_add(s.real_bytes_down);
        table.add_row(Row::from(vec![
            s.period_id.to_string(),
            s.period_start.format("%Y-%m-%d %H:%M").to_string(),
            s.period_end.format("%Y-%m-%d %H:%M").to_string(),
            state.to_string(),
            format_bytes(real),
            format_bytes(s.billable_total()),
            format_bytes(s.quota_bytes),
            format!("{:.1}%", s.quota_used_pct()),
        ]));
    }

    let mut out = table.to_string();

    if let Some(current) = snapshots.iter().find(|s| s.is_current) {
        if !current.nodes.is_empty() {
            let mut nodes = Table::new();
            nodes.set_content_arrangement(ContentArrangement::Dynamic);
            header(&mut nodes, &["Node", "Up", "Down", "Billable up", "Billable down"], no_color);
            for n in &current.nodes {
                nodes.add_row(Row::from(vec![
                    n.node_id.to_string(),
                    format_bytes(n.real_bytes_up),
                    format_bytes(n.real_bytes_down),
                    format_bytes(n.billable_bytes_up),
                    format_bytes(n.billable_bytes_down),
                ]));
            }
            out.push_str("\n\nCurrent period by node:\n");
            out.push_str(&nodes.to_string());
        }
    }

    out
}

/// Live device counts per subscriber
pub fn format_device_counts(counts: &BTreeMap<u64, u32>, json: bool, no_color: bool) -> String {
    if json {
        return serde_json::to_string_pretty(&json!({ "alive": counts }))
            .unwrap_or_else(|_| "{}".to_string());
    }

    if counts.is_empty() {
        return "No devices online.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(&mut table, &["Subscriber", "Devices"], no_color);
    for (subscriber_id, count) in counts {
        table.add_row(Row::from(vec![subscriber_id.to_string(), count.to_string()]));
    }

    let total: u64 = counts.values().map(|c| u64::from(*c)).sum();
    format!("{table}\nTotal: {total}")
}

// ============================================================================
// Summaries
// ============================================================================

pub fn format_ingest_outcome(outcome: &IngestOutcome, json: bool) -> String {
    if json {
        let issues: Vec<_> = outcome
            .issues
            .iter()
            .map(|i| {
                json!({
                    "source": i.source,
                    "subscriber_id": i.subscriber_id,
                    "message": i.message,
                    "severity": severity_label(i.severity),
                })
            })
            .collect();
        return serde_json::to_string_pretty(&json!({
            "received": outcome.received,
            "applied": outcome.applied,
            "malformed": outcome.malformed,
            "rejected": outcome.rejected,
            "failed": outcome.failed,
            "issues": issues,
        }))
        .unwrap_or_else(|_| "{}".to_string());
    }

    let mut lines = vec![format!(
        "Received {}, applied {}, malformed {}, rejected {}, failed {}",
        outcome.received, outcome.applied, outcome.malformed, outcome.rejected, outcome.failed
    )];
    for issue in &outcome.issues {
        let who = issue
            .subscriber_id
            .map(|id| format!(" subscriber {id}"))
            .unwrap_or_default();
        lines.push(format!(
            "  [{}] {}{}: {}",
            severity_label(issue.severity),
            issue.source,
            who,
            issue.message
        ));
    }
    lines.join("\n")
}

pub fn format_sweep(report: &SweepReport, removed_devices: usize) -> String {
    format!(
        "Periods: {} expired, {} closed, {} reopened, {} failed\nDevices: {} stale sightings removed",
        report.examined, report.closed, report.reopened, report.failed, removed_devices
    )
}

fn severity_label(severity: IssueSeverity) -> &'static str {
    match severity {
        IssueSeverity::Notice => "notice",
        IssueSeverity::Error => "error",
        IssueSeverity::Fatal => "fatal",
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meterboard_core::IngestIssue;

    fn snapshot(is_current: bool) -> UsageSnapshot {
        UsageSnapshot {
            subscriber_id: 1,
            period_id: 4,
            period_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            is_current,
            real_bytes_up: 512,
            real_bytes_down: 512,
            billable_bytes_up: 1024,
            billable_bytes_down: 1024,
            quota_bytes: 4096,
            nodes: Vec::new(),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_format_usage_table() {
        let out = format_usage(&[snapshot(true)], false, true);
        assert!(out.contains("current"));
        assert!(out.contains("50.0%"));
        assert!(out.contains("2.0 KiB"));
    }

    #[test]
    fn test_format_usage_empty_and_json() {
        assert_eq!(format_usage(&[], false, true), "No accounting periods found.");
        let json = format_usage(&[snapshot(false)], true, false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["period_id"], 4);
        assert_eq!(value[0]["is_current"], false);
    }

    #[test]
    fn test_format_device_counts() {
        let counts = BTreeMap::from([(1, 2), (7, 1)]);
        let out = format_device_counts(&counts, false, true);
        assert!(out.ends_with("Total: 3"));
        let json = format_device_counts(&counts, true, true);
        assert!(json.contains("\"7\": 1"));
        assert_eq!(format_device_counts(&BTreeMap::new(), false, true), "No devices online.");
    }

    #[test]
    fn test_format_ingest_outcome() {
        let outcome = IngestOutcome {
            received: 3,
            applied: 2,
            malformed: 1,
            issues: vec![IngestIssue::notice("normalize", "item 2: expected a pair")],
            ..Default::default()
        };
        let out = format_ingest_outcome(&outcome, false);
        assert!(out.starts_with("Received 3, applied 2, malformed 1"));
        assert!(out.contains("[notice] normalize: item 2"));

        let json: serde_json::Value =
            serde_json::from_str(&format_ingest_outcome(&outcome, true)).unwrap();
        assert_eq!(json["issues"][0]["severity"], "notice");
    }
}
