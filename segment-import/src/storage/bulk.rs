//! Bulk-mutation transactions
//!
//! SQLite ignores `PRAGMA foreign_keys` while a transaction is open, so
//! enforcement is switched off before `BEGIN` and switched back on by the
//! guard after the transaction has committed or rolled back. Before the
//! commit, `PRAGMA foreign_key_check` must come back empty.

use crate::types::{ImportError, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeMap;

use super::StorageResultExt;

/// Disables foreign-key enforcement until dropped
pub(crate) struct ForeignKeySuspension<'c> {
    conn: &'c Connection,
    restore: bool,
}

impl<'c> ForeignKeySuspension<'c> {
    pub(crate) fn begin(conn: &'c Connection) -> Result<Self> {
        if !conn.is_autocommit() {
            return Err(ImportError::TransactionState(
                "foreign keys cannot be suspended inside an open transaction".to_string(),
            ));
        }

        let restore: bool = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .storage_context(|| "reading foreign_keys pragma")?;
        conn.pragma_update(None, "foreign_keys", false)
            .storage_context(|| "suspending foreign keys")?;

        log::trace!("Foreign keys suspended (restore: {})", restore);
        Ok(Self { conn, restore })
    }
}

impl Drop for ForeignKeySuspension<'_> {
    fn drop(&mut self) {
        if !self.restore {
            return;
        }
        if let Err(e) = self.conn.pragma_update(None, "foreign_keys", true) {
            log::error!("Failed to re-enable foreign keys: {}", e);
        } else {
            log::trace!("Foreign keys re-enabled");
        }
    }
}

/// Run `work` in one IMMEDIATE transaction with foreign keys suspended
///
/// The transaction is dropped (rolled back) before the suspension guard on
/// every error path, so enforcement is restored outside any transaction.
pub(crate) fn with_bulk_mutation<T>(
    conn: &Connection,
    work: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let _suspension = ForeignKeySuspension::begin(conn)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .storage_context(|| "beginning bulk transaction")?;

    let value = work(&tx)?;
    check_foreign_keys(&tx)?;

    tx.commit().storage_context(|| "committing bulk transaction")?;
    Ok(value)
}

/// Fail with the first table holding rows whose parent is gone
fn check_foreign_keys(tx: &Transaction<'_>) -> Result<()> {
    let mut stmt = tx
        .prepare("PRAGMA foreign_key_check")
        .storage_context(|| "checking foreign keys")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .storage_context(|| "checking foreign keys")?;

    let mut violations: BTreeMap<String, u64> = BTreeMap::new();
    for table in tables {
        let table = table.storage_context(|| "reading foreign key violations")?;
        *violations.entry(table).or_insert(0) += 1;
    }

    match violations.into_iter().next() {
        None => Ok(()),
        Some((table, rows)) => {
            log::error!("Bulk transaction left {} orphaned rows in {}", rows, table);
            Err(ImportError::ForeignKeyViolation { table, rows })
        }
    }
}

/// Run `work` in one IMMEDIATE transaction with enforcement unchanged
pub(crate) fn with_write_transaction<T>(
    conn: &Connection,
    work: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .storage_context(|| "beginning write transaction")?;

    let value = work(&tx)?;

    tx.commit().storage_context(|| "committing write transaction")?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foreign_keys(conn: &Connection) -> bool {
        conn.pragma_query_value(None, "foreign_keys", |row| row.get(0)).unwrap()
    }

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", true).unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (parent_id INTEGER NOT NULL REFERENCES parent(id));
             INSERT INTO parent (id) VALUES (1);
             INSERT INTO child (parent_id) VALUES (1);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_enforcement_off_inside_and_restored_after_commit() {
        let conn = connection();
        with_bulk_mutation(&conn, |tx| {
            assert!(!foreign_keys(tx));
            // Parent first: would fail with enforcement on
            tx.execute("DELETE FROM parent", [])?;
            tx.execute("DELETE FROM child", [])?;
            Ok(())
        })
        .unwrap();

        assert!(foreign_keys(&conn));
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_enforcement_restored_after_failure() {
        let conn = connection();
        let result: Result<()> = with_bulk_mutation(&conn, |tx| {
            tx.execute("DELETE FROM child", [])?;
            tx.execute("DELETE FROM no_such_table", [])?;
            Ok(())
        });

        assert!(result.is_err());
        assert!(foreign_keys(&conn));
        let children: i64 = conn
            .query_row("SELECT COUNT(*) FROM child", [], |row| row.get(0))
            .unwrap();
        assert_eq!(children, 1);
    }

    #[test]
    fn test_orphaned_rows_abort_commit() {
        let conn = connection();
        let result: Result<()> = with_bulk_mutation(&conn, |tx| {
            tx.execute("DELETE FROM parent", [])?;
            Ok(())
        });

        match result {
            Err(ImportError::ForeignKeyViolation { table, rows }) => {
                assert_eq!(table, "child");
                assert_eq!(rows, 1);
            }
            other => panic!("expected a foreign key violation, got {other:?}"),
        }
        assert!(foreign_keys(&conn));
        let parents: i64 = conn
            .query_row("SELECT COUNT(*) FROM parent", [], |row| row.get(0))
            .unwrap();
        assert_eq!(parents, 1);
    }

    #[test]
    fn test_suspension_refused_inside_transaction() {
        let conn = connection();
        conn.execute_batch("BEGIN").unwrap();
        assert!(matches!(
            ForeignKeySuspension::begin(&conn),
            Err(ImportError::TransactionState(_))
        ));
        conn.execute_batch("ROLLBACK").unwrap();
        assert!(foreign_keys(&conn));
    }
}
