//! Online device sightings

use super::ledger::{from_unix, to_unix, Ledger};
use crate::error::{CoreError, Result};
use crate::models::{NodeId, OnlineDeviceRecord, SubscriberId};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::BTreeMap;

impl Ledger<'_> {
    /// Insert a sighting or refresh its last_seen (never moves backwards)
    pub fn upsert_device(
        &self,
        subscriber_id: SubscriberId,
        node_id: NodeId,
        address: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO online_devices (subscriber_id, node_id, address, last_seen)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(subscriber_id, node_id, address) DO UPDATE SET
                    last_seen = MAX(last_seen, excluded.last_seen)",
                params![subscriber_id, node_id, address, to_unix(seen_at)],
            )
            .map_err(CoreError::db("upsert device"))?;
        Ok(())
    }

    /// Distinct addresses seen for the subscriber at or after `since`, across nodes
    pub fn distinct_device_count(
        &self,
        subscriber_id: SubscriberId,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(DISTINCT address) FROM online_devices
                 WHERE subscriber_id = ? AND last_seen >= ?",
                params![subscriber_id, to_unix(since)],
                |row| row.get(0),
            )
            .map_err(CoreError::db("count devices"))
    }

    /// Distinct live addresses per subscriber; subscribers with none are absent
    pub fn all_distinct_device_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<SubscriberId, u32>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT subscriber_id, COUNT(DISTINCT address) FROM online_devices
                 WHERE last_seen >= ? GROUP BY subscriber_id",
            )
            .map_err(CoreError::db("prepare device counts"))?;

        let rows = stmt
            .query_map(params![to_unix(since)], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(CoreError::db("query device counts"))?;

        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(CoreError::db("read device counts"))
    }

    /// Drop sightings last seen before `cutoff`; returns how many were removed
    pub fn delete_devices_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM online_devices WHERE last_seen < ?",
                params![to_unix(cutoff)],
            )
            .map_err(CoreError::db("delete stale devices"))
    }

    pub fn devices_for(&self, subscriber_id: SubscriberId) -> Result<Vec<OnlineDeviceRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT subscriber_id, node_id, address, last_seen FROM online_devices
                 WHERE subscriber_id = ? ORDER BY last_seen DESC, node_id, address",
            )
            .map_err(CoreError::db("prepare devices"))?;

        let rows = stmt
            .query_map(params![subscriber_id], |row| {
                Ok(OnlineDeviceRecord {
                    subscriber_id: row.get(0)?,
                    node_id: row.get(1)?,
                    address: row.get(2)?,
                    last_seen: from_unix(row, 3)?,
                })
            })
            .map_err(CoreError::db("query devices"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(CoreError::db("read devices"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::SqliteStore;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_same_address_on_two_nodes_counts_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        store
            .transaction("seed", Duration::from_secs(1), |l| {
                l.upsert_device(1, 10, "1.1.1.1", now)?;
                l.upsert_device(1, 11, "1.1.1.1", now)?;
                l.upsert_device(1, 10, "2.2.2.2", now)?;
                l.upsert_device(2, 10, "3.3.3.3", now - ChronoDuration::minutes(30))
            })
            .unwrap();

        let since = now - ChronoDuration::minutes(5);
        assert_eq!(store.read(|l| l.distinct_device_count(1, since)).unwrap(), 2);
        assert_eq!(store.read(|l| l.distinct_device_count(2, since)).unwrap(), 0);

        let all = store.read(|l| l.all_distinct_device_counts(since)).unwrap();
        assert_eq!(all.get(&1), Some(&2));
        assert!(!all.contains_key(&2));
    }

    #[test]
    fn test_last_seen_never_moves_backwards_and_sweep() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        store
            .transaction("seed", Duration::from_secs(1), |l| {
                l.upsert_device(1, 10, "1.1.1.1", now)?;
                l.upsert_device(1, 10, "1.1.1.1", now - ChronoDuration::hours(1))?;
                l.upsert_device(1, 10, "9.9.9.9", now - ChronoDuration::hours(1))
            })
            .unwrap();

        let devices = store.read(|l| l.devices_for(1)).unwrap();
        assert_eq!(devices[0].address, "1.1.1.1");
        assert_eq!(devices[0].last_seen, now);

        let removed = store
            .transaction("sweep", Duration::from_secs(1), |l| {
                l.delete_devices_before(now - ChronoDuration::minutes(5))
            })
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.read(|l| l.devices_for(1)).unwrap().len(), 1);
    }
}
