//! SQLite storage for routes, segments and the rows they own
//!
//! # Transactions
//!
//! - A segment upsert runs in one `BEGIN IMMEDIATE` transaction: detect the
//!   existing segment, remove its children, write the header, insert the new
//!   children, refresh route aggregates.
//! - Route deletion runs in one bulk-mutation transaction with foreign-key
//!   enforcement suspended (see [`bulk`]).
//! - Writers on the same route are serialised through a per-route lock
//!   shared by every connection opened from one [`StoreHandle`].
//!
//! Each thread opens its own [`Store`]; `rusqlite::Connection` is `Send` but
//! not `Sync`.

mod bulk;
mod custom;
mod definitions;
mod locks;
mod migrations;
mod models;
mod queries;
mod routes;
mod segments;

pub use definitions::DefinitionUpsert;
pub use locks::{RouteLockGuard, RouteLocks};
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use models::{
    ChildRowCounts, CustomSignal, DeletionOutcome, RouteRecord, SamplePoint, SegmentChildren, SegmentHeader,
    SegmentRecord, SignalSummary, StoreStats, UpsertOutcome,
};
pub use queries::RematerializeOutcome;

use crate::types::{ImportError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Tables whose rows are owned by a segment, deepest first
pub(crate) const CHILD_TABLES: [&str; 4] = [
    "timeseries_data",
    "can_messages",
    "log_messages",
    "video_frame_timestamps",
];

/// Attach a description of the failed storage step to a rusqlite error
pub(crate) trait StorageResultExt<T> {
    fn storage_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> StorageResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn storage_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| ImportError::Storage {
            context: context().into(),
            source,
        })
    }
}

/// Prefix the context of a storage error with the identity being written
pub(crate) fn with_identity(err: ImportError, identity: &str) -> ImportError {
    match err {
        ImportError::Storage { context, source } => ImportError::Storage {
            context: format!("{identity} ({context})"),
            source,
        },
        other => other,
    }
}

/// One connection to the segment database
pub struct Store {
    conn: Connection,
    locks: Arc<RouteLocks>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (and migrate) a database file with its own lock registry
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_locks(path, RouteLocks::new())
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().storage_context(|| "opening in-memory database")?;
        configure(&conn)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self {
            conn,
            locks: RouteLocks::new(),
            path: None,
        })
    }

    fn open_with_locks(path: &Path, locks: Arc<RouteLocks>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)
            .storage_context(|| format!("opening database {}", path.display()))?;
        configure(&conn)?;
        migrations::run_migrations(&mut conn)?;

        log::debug!("Opened database connection to {}", path.display());
        Ok(Self {
            conn,
            locks,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Handle sharing this store's lock registry, for file-backed stores
    pub fn handle(&self) -> Option<StoreHandle> {
        self.path.as_ref().map(|path| StoreHandle {
            path: path.clone(),
            locks: Arc::clone(&self.locks),
        })
    }

    pub fn foreign_keys_enabled(&self) -> Result<bool> {
        self.conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .storage_context(|| "reading foreign_keys pragma")
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn lock_route(&self, route_id: &str) -> RouteLockGuard {
        self.locks.acquire(route_id)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .storage_context(|| "enabling WAL journal")?;
    log::trace!("journal_mode = {}", mode);

    conn.pragma_update(None, "synchronous", "NORMAL")
        .storage_context(|| "setting synchronous pragma")?;
    conn.pragma_update(None, "foreign_keys", true)
        .storage_context(|| "enabling foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .storage_context(|| "setting busy timeout")?;
    Ok(())
}

/// Cloneable factory for connections that share one lock registry
#[derive(Debug, Clone)]
pub struct StoreHandle {
    path: PathBuf,
    locks: Arc<RouteLocks>,
}

impl StoreHandle {
    /// Open the database once (running migrations) and keep its path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let locks = RouteLocks::new();
        Store::open_with_locks(&path, Arc::clone(&locks))?;
        log::info!("Database ready at {}", path.display());
        Ok(Self { path, locks })
    }

    /// Open a new connection for the calling thread
    pub fn connect(&self) -> Result<Store> {
        Store::open_with_locks(&self.path, Arc::clone(&self.locks))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        ImportError::ValueOutOfRange(format!("{field} value {value} exceeds SQLite INTEGER range"))
    })
}

pub(crate) fn opt_to_i64(value: Option<u64>, field: &str) -> Result<Option<i64>> {
    value.map(|v| to_i64(v, field)).transpose()
}

pub(crate) fn get_u64(row: &Row<'_>, column: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::IntegralValueOutOfRange(row.as_ref().column_index(column).unwrap_or(0), value)
    })
}

pub(crate) fn get_opt_u64(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(column)?;
    value
        .map(|v| {
            u64::try_from(v).map_err(|_| {
                rusqlite::Error::IntegralValueOutOfRange(row.as_ref().column_index(column).unwrap_or(0), v)
            })
        })
        .transpose()
}

pub(crate) fn get_datetime(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                row.as_ref().column_index(column).unwrap_or(0),
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_runs_migrations() {
        let store = Store::open_in_memory().unwrap();
        let version: i32 = store
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_handle_connections_share_locks() {
        let dir = TempDir::new().unwrap();
        let handle = StoreHandle::open(dir.path().join("nested").join("segments.db")).unwrap();

        let first = handle.connect().unwrap();
        let second = handle.connect().unwrap();
        let _guard = first.lock_route("route");
        assert!(second.locks.is_locked("route"));
        assert_eq!(second.path(), Some(handle.path()));
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segments.db");
        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        assert_eq!(store.stats().unwrap().routes, 0);
    }

    #[test]
    fn test_storage_context_wraps_identity() {
        let err = Err::<(), _>(rusqlite::Error::QueryReturnedNoRows)
            .storage_context(|| "reading segment")
            .unwrap_err();
        let err = with_identity(err, "segment 3 of route r");
        assert!(err.to_string().contains("segment 3 of route r (reading segment)"));
    }
}
