//! Period and node-usage rows
//!
//! `Ledger` is a borrowed view over a connection or an open transaction. All
//! multi-statement mutations go through `SqliteStore::transaction`, which
//! hands out a `Ledger` bound to the transaction.

use crate::error::{CoreError, Result};
use crate::models::{
    AccountingPeriod, NodeId, NodeUsage, PeriodBounds, PeriodId, PlanId, SubscriberId,
    UsageCounters,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

const PERIOD_COLUMNS: &str = "id, subscriber_id, plan_id, period_start, period_end, \
     real_up, real_down, billable_up, billable_down, is_current";

/// Borrowed view over the ledger tables
pub struct Ledger<'a> {
    pub(super) conn: &'a Connection,
}

impl<'a> Ledger<'a> {
    pub(super) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn schema_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .map_err(CoreError::db("read schema version"))
    }

    // ===================
    // Periods
    // ===================

    /// The subscriber's current period, if any
    pub fn current_period(&self, subscriber_id: SubscriberId) -> Result<Option<AccountingPeriod>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {PERIOD_COLUMNS} FROM accounting_periods
                 WHERE subscriber_id = ? AND is_current = 1"
            ))
            .map_err(CoreError::db("prepare current period"))?;

        let mut periods = stmt
            .query_map(params![subscriber_id], period_from_row)
            .map_err(CoreError::db("query current period"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read current period"))?;

        match periods.len() {
            0 => Ok(None),
            1 => Ok(periods.pop()),
            n => Err(CoreError::invariant(format!(
                "subscriber {subscriber_id} has {n} current periods"
            ))),
        }
    }

    pub fn period(&self, period_id: PeriodId) -> Result<Option<AccountingPeriod>> {
        self.conn
            .query_row(
                &format!("SELECT {PERIOD_COLUMNS} FROM accounting_periods WHERE id = ?"),
                params![period_id],
                period_from_row,
            )
            .optional()
            .map_err(CoreError::db("read period"))
    }

    /// Open a new current period with zero counters.
    ///
    /// Fails with an invariant violation if the subscriber already has one.
    pub fn insert_period(
        &self,
        subscriber_id: SubscriberId,
        plan_id: PlanId,
        bounds: PeriodBounds,
    ) -> Result<AccountingPeriod> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO accounting_periods (subscriber_id, plan_id, period_start, period_end, is_current)
                 VALUES (?, ?, ?, ?, 1)",
                params![
                    subscriber_id,
                    plan_id,
                    to_unix(bounds.start),
                    to_unix(bounds.end)
                ],
            )
            .map_err(CoreError::db("insert period"));

        match inserted {
            Ok(_) => {}
            Err(err) if err.is_unique_violation() => {
                return Err(CoreError::invariant(format!(
                    "subscriber {subscriber_id} already has a current period"
                )));
            }
            Err(err) => return Err(err),
        }

        let id = u64::try_from(self.conn.last_insert_rowid())
            .map_err(|_| CoreError::invariant("negative period id"))?;

        Ok(AccountingPeriod {
            id,
            subscriber_id,
            plan_id,
            bounds,
            counters: UsageCounters::default(),
            is_current: true,
        })
    }

    /// Mark a current period closed; exactly one row must flip
    pub fn close_period(&self, period_id: PeriodId, closed_at: DateTime<Utc>) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounting_periods SET is_current = 0, closed_at = ?
                 WHERE id = ? AND is_current = 1",
                params![to_unix(closed_at), period_id],
            )
            .map_err(CoreError::db("close period"))?;

        if changed != 1 {
            return Err(CoreError::invariant(format!(
                "period {period_id} was not current when closing"
            )));
        }
        Ok(())
    }

    /// Add deltas to a period that is still current
    pub fn increment_period(&self, period_id: PeriodId, delta: &UsageCounters) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounting_periods SET
                    real_up = real_up + ?,
                    real_down = real_down + ?,
                    billable_up = billable_up + ?,
                    billable_down = billable_down + ?
                 WHERE id = ? AND is_current = 1",
                params![
                    delta.real_up,
                    delta.real_down,
                    delta.billable_up,
                    delta.billable_down,
                    period_id
                ],
            )
            .map_err(CoreError::db("increment period"))?;

        if changed != 1 {
            return Err(CoreError::invariant(format!(
                "period {period_id} is not current and cannot be incremented"
            )));
        }
        Ok(())
    }

    /// Create or accumulate the (subscriber, node, period) breakdown row
    pub fn upsert_node_usage(
        &self,
        subscriber_id: SubscriberId,
        node_id: NodeId,
        period_id: PeriodId,
        delta: &UsageCounters,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO node_usage
                    (subscriber_id, node_id, period_id, real_up, real_down, billable_up, billable_down)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(subscriber_id, node_id, period_id) DO UPDATE SET
                    real_up = real_up + excluded.real_up,
                    real_down = real_down + excluded.real_down,
                    billable_up = billable_up + excluded.billable_up,
                    billable_down = billable_down + excluded.billable_down",
                params![
                    subscriber_id,
                    node_id,
                    period_id,
                    delta.real_up,
                    delta.real_down,
                    delta.billable_up,
                    delta.billable_down
                ],
            )
            .map_err(CoreError::db("upsert node usage"))?;
        Ok(())
    }

    /// Per-node breakdown of a period, ordered by node
    pub fn node_usage(&self, period_id: PeriodId) -> Result<Vec<NodeUsage>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT subscriber_id, node_id, period_id, real_up, real_down, billable_up, billable_down
                 FROM node_usage WHERE period_id = ? ORDER BY node_id",
            )
            .map_err(CoreError::db("prepare node usage"))?;

        let rows = stmt
            .query_map(params![period_id], |row| {
                Ok(NodeUsage {
                    subscriber_id: row.get(0)?,
                    node_id: row.get(1)?,
                    period_id: row.get(2)?,
                    counters: UsageCounters {
                        real_up: row.get(3)?,
                        real_down: row.get(4)?,
                        billable_up: row.get(5)?,
                        billable_down: row.get(6)?,
                    },
                })
            })
            .map_err(CoreError::db("query node usage"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read node usage"))
    }

    /// Every current period keyed by subscriber
    pub fn current_periods(&self) -> Result<HashMap<SubscriberId, AccountingPeriod>> {
        let periods = self.query_periods(
            &format!("SELECT {PERIOD_COLUMNS} FROM accounting_periods WHERE is_current = 1"),
            params![],
        )?;

        let mut by_subscriber = HashMap::with_capacity(periods.len());
        for period in periods {
            if by_subscriber.insert(period.subscriber_id, period).is_some() {
                return Err(CoreError::invariant(
                    "more than one current period for a subscriber",
                ));
            }
        }
        Ok(by_subscriber)
    }

    /// Current periods whose window ended at or before `now`
    pub fn expired_current_periods(&self, now: DateTime<Utc>) -> Result<Vec<AccountingPeriod>> {
        self.query_periods(
            &format!(
                "SELECT {PERIOD_COLUMNS} FROM accounting_periods
                 WHERE is_current = 1 AND period_end <= ? ORDER BY subscriber_id"
            ),
            params![to_unix(now)],
        )
    }

    /// Most recent periods first
    pub fn period_history(
        &self,
        subscriber_id: SubscriberId,
        limit: usize,
    ) -> Result<Vec<AccountingPeriod>> {
        self.query_periods(
            &format!(
                "SELECT {PERIOD_COLUMNS} FROM accounting_periods
                 WHERE subscriber_id = ? ORDER BY period_start DESC, id DESC LIMIT ?"
            ),
            params![subscriber_id, limit as i64],
        )
    }

    pub fn count_current_periods(&self, subscriber_id: SubscriberId) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM accounting_periods WHERE subscriber_id = ? AND is_current = 1",
                params![subscriber_id],
                |row| row.get(0),
            )
            .map_err(CoreError::db("count current periods"))
    }

    fn query_periods(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AccountingPeriod>> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(CoreError::db("prepare periods"))?;
        let rows = stmt
            .query_map(params, period_from_row)
            .map_err(CoreError::db("query periods"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read periods"))
    }
}

fn period_from_row(row: &Row<'_>) -> rusqlite::Result<AccountingPeriod> {
    Ok(AccountingPeriod {
        id: row.get(0)?,
        subscriber_id: row.get(1)?,
        plan_id: row.get(2)?,
        bounds: PeriodBounds {
            start: from_unix(row, 3)?,
            end: from_unix(row, 4)?,
        },
        counters: UsageCounters {
            real_up: row.get(5)?,
            real_down: row.get(6)?,
            billable_up: row.get(7)?,
            billable_down: row.get(8)?,
        },
        is_current: row.get(9)?,
    })
}

pub(super) fn to_unix(instant: DateTime<Utc>) -> i64 {
    instant.timestamp()
}

pub(super) fn from_unix(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

pub(super) fn from_unix_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(secs) => DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs)),
        None => Ok(None),
    }
}
