use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub(crate) const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS messages (
  message_id TEXT PRIMARY KEY CHECK (length(trim(message_id)) > 0),
  sent_at_ns INTEGER NOT NULL,
  expires_at_ns INTEGER,
  body_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  unread INTEGER NOT NULL CHECK (unread IN (0, 1)),
  deleted INTEGER NOT NULL CHECK (deleted IN (0, 1)),
  orphaned_at_ns INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at_ns DESC, message_id ASC);
CREATE INDEX IF NOT EXISTS idx_messages_deleted ON messages(deleted);
CREATE INDEX IF NOT EXISTS idx_messages_expires_at ON messages(expires_at_ns);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = detect_effective_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
    })
}

/// Bring the store schema up to [`LATEST_SCHEMA_VERSION`].
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let mut version = current_schema_version(conn)?;
    if version == 0 {
        version = bootstrap_schema_version(conn)?;
    }

    if version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        ));
    }

    Ok(())
}

fn bootstrap_schema_version(conn: &mut Connection) -> Result<i64> {
    if !table_exists(conn, "messages")? {
        let tx = conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        return Ok(1);
    }

    Err(anyhow!(
        "database schema is invalid: messages table exists without a recorded schema version"
    ))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<i64> {
    let recorded = current_schema_version(conn)?;
    if recorded == 0 && table_exists(conn, "messages")? {
        return Err(anyhow!(
            "database schema is invalid: messages table exists without a recorded schema version"
        ));
    }
    Ok(recorded)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_migrates_to_latest() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let before = schema_status(&conn)?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        migrate(&mut conn)?;
        let after = schema_status(&conn)?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        migrate(&mut conn)?;
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn unversioned_messages_tables_are_refused() -> Result<()> {
        for ddl in [MIGRATION_001_SQL, "CREATE TABLE messages(id INTEGER PRIMARY KEY, body TEXT);"] {
            let mut conn = Connection::open_in_memory()?;
            conn.execute_batch(ddl)?;

            assert!(schema_status(&conn).is_err());
            let err = match migrate(&mut conn) {
                Ok(()) => return Err(anyhow!("expected an unversioned schema to be refused")),
                Err(err) => err,
            };
            assert!(err.to_string().contains("without a recorded schema version"));
            assert_eq!(current_schema_version(&conn)?, 0);
        }
        Ok(())
    }

    #[test]
    fn newer_schema_versions_are_refused() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        record_schema_version(&conn, LATEST_SCHEMA_VERSION + 1)?;

        let err = match migrate(&mut conn) {
            Ok(()) => return Err(anyhow!("expected newer schema to be refused")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unsupported schema version"));
        Ok(())
    }
}
