//! Catalog tables: plans, nodes, subscribers
//!
//! `SqliteStore` doubles as a `Directory` so a single database file can hold
//! both the catalog and the ledger. The `put_*` helpers provision rows; the
//! admin surface that normally owns them lives outside this crate.

use super::ledger::{from_unix_opt, to_unix, Ledger};
use super::SqliteStore;
use crate::directory::Directory;
use crate::error::{CoreError, Result};
use crate::models::{
    LabelId, Node, NodeId, NodeStatus, Plan, PlanId, ResetCadence, Subscriber, SubscriberId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::HashMap;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl Ledger<'_> {
    pub fn load_plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, quota_bytes, reset_cadence, base_multiplier, speed_limit, device_limit
                 FROM plans WHERE id = ?",
                params![plan_id],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<u64>>(5)?,
                        row.get::<_, Option<u32>>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(CoreError::db("read plan"))?;

        let Some((id, name, quota_bytes, cadence, base_multiplier, speed_limit, device_limit)) = row
        else {
            return Ok(None);
        };

        let reset_cadence = cadence.parse::<ResetCadence>().map_err(|e| {
            CoreError::invariant(format!("plan {id} has invalid reset cadence: {e}"))
        })?;

        Ok(Some(Plan {
            id,
            name,
            quota_bytes,
            reset_cadence,
            base_multiplier,
            labels: self.labels("SELECT label_id FROM plan_labels WHERE plan_id = ? ORDER BY label_id", id)?,
            label_multipliers: self.label_multipliers(id)?,
            speed_limit,
            device_limit,
        }))
    }

    pub fn load_node(&self, node_id: NodeId) -> Result<Option<Node>> {
        let node = self
            .conn
            .query_row(
                "SELECT id, name, node_type, port, protocol_config, multiplier, status, last_seen_at
                 FROM nodes WHERE id = ?",
                params![node_id],
                |row| {
                    let status: String = row.get(6)?;
                    Ok(Node {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        node_type: row.get(2)?,
                        port: row.get(3)?,
                        protocol_config: row.get(4)?,
                        multiplier: row.get(5)?,
                        labels: Vec::new(),
                        // Unknown statuses are treated as inactive
                        status: status.parse().unwrap_or(NodeStatus::Inactive),
                        last_seen_at: from_unix_opt(row, 7)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::db("read node"))?;

        match node {
            Some(mut node) => {
                node.labels = self.labels(
                    "SELECT label_id FROM node_labels WHERE node_id = ? ORDER BY label_id",
                    node.id,
                )?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub fn load_subscriber(&self, subscriber_id: SubscriberId) -> Result<Option<Subscriber>> {
        self.conn
            .query_row(
                "SELECT id, uuid, plan_id, banned FROM subscribers WHERE id = ?",
                params![subscriber_id],
                |row| {
                    Ok(Subscriber {
                        id: row.get(0)?,
                        uuid: row.get(1)?,
                        plan_id: row.get(2)?,
                        banned: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::db("read subscriber"))
    }

    fn labels(&self, sql: &str, owner: u64) -> Result<Vec<LabelId>> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(CoreError::db("prepare labels"))?;
        let rows = stmt
            .query_map(params![owner], |row| row.get(0))
            .map_err(CoreError::db("query labels"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read labels"))
    }

    fn label_multipliers(&self, plan_id: PlanId) -> Result<HashMap<LabelId, f64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT label_id, multiplier FROM plan_label_multipliers WHERE plan_id = ?")
            .map_err(CoreError::db("prepare label multipliers"))?;
        let rows = stmt
            .query_map(params![plan_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(CoreError::db("query label multipliers"))?;
        rows.collect::<rusqlite::Result<HashMap<_, _>>>()
            .map_err(CoreError::db("read label multipliers"))
    }

    fn plan_ids_with_any_label(&self, labels: &[LabelId]) -> Result<Vec<PlanId>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT plan_id FROM plan_labels WHERE label_id IN ({}) ORDER BY plan_id",
            placeholders(labels.len())
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(CoreError::db("prepare plans by label"))?;
        let rows = stmt
            .query_map(params_from_iter(labels.iter()), |row| row.get(0))
            .map_err(CoreError::db("query plans by label"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read plans by label"))
    }

    fn subscribers_on(&self, plan_ids: &[PlanId]) -> Result<Vec<Subscriber>> {
        if plan_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, uuid, plan_id, banned FROM subscribers WHERE plan_id IN ({}) ORDER BY id",
            placeholders(plan_ids.len())
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(CoreError::db("prepare subscribers by plan"))?;
        let rows = stmt
            .query_map(params_from_iter(plan_ids.iter()), |row| {
                Ok(Subscriber {
                    id: row.get(0)?,
                    uuid: row.get(1)?,
                    plan_id: row.get(2)?,
                    banned: row.get(3)?,
                })
            })
            .map_err(CoreError::db("query subscribers by plan"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read subscribers by plan"))
    }

    fn touch(&self, node_id: NodeId, at: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE nodes SET last_seen_at = ? WHERE id = ?",
                params![to_unix(at), node_id],
            )
            .map_err(CoreError::db("touch node"))
    }
}

impl Directory for SqliteStore {
    fn subscriber(&self, subscriber_id: SubscriberId) -> Result<Subscriber> {
        self.read(|l| l.load_subscriber(subscriber_id))?
            .ok_or(CoreError::SubscriberNotFound { subscriber_id })
    }

    fn plan(&self, plan_id: PlanId) -> Result<Plan> {
        self.read(|l| l.load_plan(plan_id))?
            .ok_or(CoreError::PlanNotFound { plan_id })
    }

    fn node(&self, node_id: NodeId) -> Result<Node> {
        self.read(|l| l.load_node(node_id))?
            .ok_or(CoreError::NodeNotFound { node_id })
    }

    fn plans_with_any_label(&self, labels: &[LabelId]) -> Result<Vec<Plan>> {
        self.read(|l| {
            let mut plans = Vec::new();
            for plan_id in l.plan_ids_with_any_label(labels)? {
                if let Some(plan) = l.load_plan(plan_id)? {
                    plans.push(plan);
                }
            }
            Ok(plans)
        })
    }

    fn subscribers_on_plans(&self, plan_ids: &[PlanId]) -> Result<Vec<Subscriber>> {
        self.read(|l| l.subscribers_on(plan_ids))
    }

    fn touch_node(&self, node_id: NodeId, at: DateTime<Utc>) -> Result<()> {
        match self.read(|l| l.touch(node_id, at))? {
            0 => Err(CoreError::NodeNotFound { node_id }),
            _ => Ok(()),
        }
    }
}

/// Provisioning
impl SqliteStore {
    pub fn put_plan(&self, plan: &Plan) -> Result<()> {
        self.write("put plan", |l| {
            l.conn
                .execute(
                    "INSERT INTO plans (id, name, quota_bytes, reset_cadence, base_multiplier, speed_limit, device_limit)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        quota_bytes = excluded.quota_bytes,
                        reset_cadence = excluded.reset_cadence,
                        base_multiplier = excluded.base_multiplier,
                        speed_limit = excluded.speed_limit,
                        device_limit = excluded.device_limit",
                    params![
                        plan.id,
                        plan.name,
                        plan.quota_bytes,
                        plan.reset_cadence.as_str(),
                        plan.base_multiplier,
                        plan.speed_limit,
                        plan.device_limit
                    ],
                )
                .map_err(CoreError::db("upsert plan"))?;

            l.conn
                .execute("DELETE FROM plan_labels WHERE plan_id = ?", params![plan.id])
                .map_err(CoreError::db("clear plan labels"))?;
            for label in &plan.labels {
                l.conn
                    .execute(
                        "INSERT OR IGNORE INTO plan_labels (plan_id, label_id) VALUES (?, ?)",
                        params![plan.id, label],
                    )
                    .map_err(CoreError::db("insert plan label"))?;
            }

            l.conn
                .execute(
                    "DELETE FROM plan_label_multipliers WHERE plan_id = ?",
                    params![plan.id],
                )
                .map_err(CoreError::db("clear label multipliers"))?;
            for (label, multiplier) in &plan.label_multipliers {
                l.conn
                    .execute(
                        "INSERT INTO plan_label_multipliers (plan_id, label_id, multiplier) VALUES (?, ?, ?)",
                        params![plan.id, label, multiplier],
                    )
                    .map_err(CoreError::db("insert label multiplier"))?;
            }
            Ok(())
        })
    }

    pub fn put_node(&self, node: &Node) -> Result<()> {
        if !(node.multiplier.is_finite() && node.multiplier > 0.0) {
            return Err(CoreError::InvalidConfig {
                message: format!("node {} multiplier must be positive", node.id),
            });
        }

        self.write("put node", |l| {
            l.conn
                .execute(
                    "INSERT INTO nodes (id, name, node_type, port, protocol_config, multiplier, status, last_seen_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        node_type = excluded.node_type,
                        port = excluded.port,
                        protocol_config = excluded.protocol_config,
                        multiplier = excluded.multiplier,
                        status = excluded.status",
                    params![
                        node.id,
                        node.name,
                        node.node_type,
                        node.port,
                        node.protocol_config,
                        node.multiplier,
                        node.status.as_str(),
                        node.last_seen_at.map(to_unix)
                    ],
                )
                .map_err(CoreError::db("upsert node"))?;

            l.conn
                .execute("DELETE FROM node_labels WHERE node_id = ?", params![node.id])
                .map_err(CoreError::db("clear node labels"))?;
            for label in &node.labels {
                l.conn
                    .execute(
                        "INSERT OR IGNORE INTO node_labels (node_id, label_id) VALUES (?, ?)",
                        params![node.id, label],
                    )
                    .map_err(CoreError::db("insert node label"))?;
            }
            Ok(())
        })
    }

    pub fn put_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        self.write("put subscriber", |l| {
            l.conn
                .execute(
                    "INSERT INTO subscribers (id, uuid, plan_id, banned) VALUES (?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        uuid = excluded.uuid,
                        plan_id = excluded.plan_id,
                        banned = excluded.banned",
                    params![
                        subscriber.id,
                        subscriber.uuid,
                        subscriber.plan_id,
                        subscriber.banned
                    ],
                )
                .map_err(CoreError::db("upsert subscriber"))?;
            Ok(())
        })
    }

    pub fn assign_plan(&self, subscriber_id: SubscriberId, plan_id: Option<PlanId>) -> Result<()> {
        self.update_subscriber(
            "assign plan",
            subscriber_id,
            "UPDATE subscribers SET plan_id = ? WHERE id = ?",
            params![plan_id, subscriber_id],
        )
    }

    pub fn set_banned(&self, subscriber_id: SubscriberId, banned: bool) -> Result<()> {
        self.update_subscriber(
            "set banned",
            subscriber_id,
            "UPDATE subscribers SET banned = ? WHERE id = ?",
            params![banned, subscriber_id],
        )
    }

    fn update_subscriber(
        &self,
        operation: &'static str,
        subscriber_id: SubscriberId,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        let changed = self.write(operation, |l| {
            l.conn.execute(sql, params).map_err(CoreError::db(operation))
        })?;
        match changed {
            0 => Err(CoreError::SubscriberNotFound { subscriber_id }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures;

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut gold = fixtures::plan(1, 1_000, vec![10, 20]);
        gold.label_multipliers.insert(20, 2.5);
        gold.speed_limit = Some(100);
        gold.reset_cadence = ResetCadence::Weekly;
        store.put_plan(&gold).unwrap();
        store.put_plan(&fixtures::plan(2, 500, vec![30])).unwrap();
        store.put_node(&fixtures::node(7, 1.5, vec![20])).unwrap();
        store.put_subscriber(&fixtures::subscriber(1, Some(1))).unwrap();
        store.put_subscriber(&fixtures::subscriber(2, Some(2))).unwrap();
        store.put_subscriber(&fixtures::subscriber(3, None)).unwrap();
        store
    }

    #[test]
    fn test_catalog_round_trips_through_directory() {
        let store = seeded();

        let plan = store.plan(1).unwrap();
        assert_eq!(plan.labels, vec![10, 20]);
        assert_eq!(plan.label_multiplier(20), 2.5);
        assert_eq!(plan.reset_cadence, ResetCadence::Weekly);
        assert_eq!(plan.speed_limit, Some(100));
        assert_eq!(plan.device_limit, None);

        let node = store.node(7).unwrap();
        assert_eq!(node.multiplier, 1.5);
        assert_eq!(node.labels, vec![20]);
        assert_eq!(node.status, NodeStatus::Active);

        assert!(matches!(
            store.subscriber(99),
            Err(CoreError::SubscriberNotFound { subscriber_id: 99 })
        ));
    }

    #[test]
    fn test_label_join_queries() {
        let store = seeded();

        let plans = store.plans_with_any_label(&[20, 99]).unwrap();
        assert_eq!(plans.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);
        assert!(store.plans_with_any_label(&[]).unwrap().is_empty());

        let subs = store.subscribers_on_plans(&[1, 2]).unwrap();
        assert_eq!(subs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_updates() {
        let store = seeded();

        store.set_banned(1, true).unwrap();
        assert!(store.subscriber(1).unwrap().banned);

        store.assign_plan(3, Some(2)).unwrap();
        assert_eq!(store.subscriber(3).unwrap().plan_id, Some(2));
        assert!(store.assign_plan(42, None).is_err());

        let at = DateTime::from_timestamp(1_736_942_400, 0).unwrap();
        store.touch_node(7, at).unwrap();
        assert_eq!(store.node(7).unwrap().last_seen_at, Some(at));
        assert!(matches!(
            store.touch_node(8, at),
            Err(CoreError::NodeNotFound { node_id: 8 })
        ));
    }

    #[test]
    fn test_rejects_non_positive_node_multiplier() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.put_node(&fixtures::node(1, 0.0, vec![])).is_err());
    }
}
