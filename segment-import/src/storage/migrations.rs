use crate::types::{ImportError, Result};
use rusqlite::{Connection, Transaction};

use super::StorageResultExt;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .storage_context(|| "reading user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(ImportError::Migration(format!(
            "database version ({}) is newer than supported schema ({})",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .storage_context(|| "opening migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .storage_context(|| "updating user_version pragma")?;
    tx.commit().storage_context(|| "committing migrations")?;

    log::info!("Database schema migrated to version {}", CURRENT_SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => tx
            .execute_batch(include_str!("schema_v1.sql"))
            .storage_context(|| "executing schema_v1.sql"),
        2 => tx
            .execute_batch(include_str!("schema_v2.sql"))
            .storage_context(|| "executing schema_v2.sql"),
        _ => Err(ImportError::Migration(format!(
            "unknown migration target version: {version}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(conn: &Connection) -> i32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
        assert!(table_exists(&conn, "segments"));
        assert!(table_exists(&conn, "custom_signals"));

        // Second run is a no-op
        run_migrations(&mut conn).unwrap();
        assert_eq!(version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_version_one_database_upgraded() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("schema_v1.sql")).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        assert!(!table_exists(&conn, "custom_signals"));

        run_migrations(&mut conn).unwrap();
        assert_eq!(version(&conn), 2);
        assert!(table_exists(&conn, "custom_signals"));
    }

    #[test]
    fn test_newer_database_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(run_migrations(&mut conn), Err(ImportError::Migration(_))));
    }
}
