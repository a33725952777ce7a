//! SQLite-backed ledger
//!
//! The relational store is the only authoritative shared state. Every
//! mutation runs in an `IMMEDIATE` transaction bounded by a deadline:
//! - connection acquisition uses a timed lock
//! - SQLite's busy timeout covers file-level contention
//! - a progress handler interrupts statements once the deadline has passed
//!
//! An interrupted transaction is rolled back and reported as
//! `CoreError::Timeout`.

mod catalog;
mod devices;
mod ledger;
mod schema;

pub use ledger::Ledger;
pub use schema::SCHEMA_VERSION;

use crate::error::{CoreError, Result};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// VM instructions between deadline checks
const PROGRESS_HANDLER_OPS: i32 = 1_000;

/// Default bound for reads and provisioning writes
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite ledger (thread-safe)
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Create or open the database file
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // WAL lets readers proceed while an increment commits
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private database for tests and one-shot tooling
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(schema::SCHEMA)
            .context("Failed to create schema")?;

        let stored_version: Option<i32> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query schema version")?;

        match stored_version {
            Some(v) if v != SCHEMA_VERSION => {
                anyhow::bail!(
                    "Database schema version {} does not match expected version {}",
                    v,
                    SCHEMA_VERSION
                );
            }
            None => {
                conn.execute(
                    "INSERT INTO schema_meta (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )
                .context("Failed to initialize schema version")?;
                debug!("Schema version initialized to {}", SCHEMA_VERSION);
            }
            Some(_) => {
                debug!("Schema version {} matches current", SCHEMA_VERSION);
            }
        }

        debug!(
            path = %path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".into()),
            "Ledger initialized"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Override the bound used by reads and provisioning writes
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside one `IMMEDIATE` transaction that must finish within `timeout`.
    ///
    /// Any error from `f` rolls the whole transaction back.
    pub fn transaction<T>(
        &self,
        operation: &'static str,
        timeout: Duration,
        f: impl FnOnce(&Ledger<'_>) -> Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut conn = self
            .conn
            .try_lock_for(timeout)
            .ok_or(CoreError::LockTimeout)?;

        conn.busy_timeout(deadline.saturating_duration_since(Instant::now()))
            .map_err(CoreError::db("set busy timeout"))?;

        match run_transaction(&mut conn, deadline, f) {
            Err(err) if err.is_sqlite_timeout() => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "Transaction deadline exceeded");
                Err(CoreError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            other => other,
        }
    }

    /// Run a read (or a single autocommit write) with the default lock bound
    pub fn read<T>(&self, f: impl FnOnce(&Ledger<'_>) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .try_lock_for(self.lock_timeout)
            .ok_or(CoreError::LockTimeout)?;
        f(&Ledger::new(&conn))
    }

    /// Provisioning writes share the default bound
    pub(crate) fn write<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Ledger<'_>) -> Result<T>,
    ) -> Result<T> {
        self.transaction(operation, self.lock_timeout, f)
    }

    /// Hold the connection so other callers hit their lock bound
    #[cfg(test)]
    pub(crate) fn hold_connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(CoreError::db("execute batch"))
    }
}

fn run_transaction<T>(
    conn: &mut Connection,
    deadline: Instant,
    f: impl FnOnce(&Ledger<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(CoreError::db("begin transaction"))?;

    tx.progress_handler(PROGRESS_HANDLER_OPS, Some(move || Instant::now() >= deadline));
    let outcome = f(&Ledger::new(&tx));
    // COMMIT and the implicit ROLLBACK on drop must never be interrupted
    tx.progress_handler(0, None::<fn() -> bool>);

    let value = outcome?;
    tx.commit().map_err(CoreError::db("commit"))?;
    Ok(value)
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if self.path.is_none() {
            return;
        }
        // Fold the WAL back into the main file so it doesn't grow across restarts
        let conn = self.conn.lock();
        if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
            warn!("Failed to checkpoint WAL on ledger drop: {}", e);
        } else {
            debug!("WAL checkpoint completed on ledger drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("meter.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());

        let version: i32 = store
            .read(|ledger| ledger.schema_version())
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meter.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .transaction("seed", Duration::from_secs(1), |ledger| {
                    ledger.upsert_device(1, 1, "10.0.0.1", chrono::Utc::now())
                })
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let since = chrono::Utc::now() - chrono::Duration::minutes(5);
        let count = store
            .read(|ledger| ledger.distinct_device_count(1, since))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = chrono::Utc::now();

        let result: Result<()> = store.transaction("rollback", Duration::from_secs(1), |ledger| {
            ledger.upsert_device(1, 1, "10.0.0.1", now)?;
            Err(CoreError::invariant("abort"))
        });
        assert!(result.is_err());

        let count = store
            .read(|ledger| ledger.distinct_device_count(1, now - chrono::Duration::minutes(1)))
            .unwrap();
        assert_eq!(count, 0);

        // Connection is usable again after the rollback
        store
            .transaction("retry", Duration::from_secs(1), |ledger| {
                ledger.upsert_device(1, 1, "10.0.0.1", now)
            })
            .unwrap();
    }

    #[test]
    fn test_lock_timeout_when_connection_held() {
        let store = SqliteStore::open_in_memory().unwrap();
        let _guard = store.conn.lock();

        let result = store.transaction("blocked", Duration::from_millis(20), |_| Ok(()));
        assert!(matches!(result, Err(CoreError::LockTimeout)));
    }
}
