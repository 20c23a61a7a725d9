//! One-time conversion from the single global legacy store into the per-namespace
//! layout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use inbox_cache_core::{
    InboundMessage, RawPayload, StoreError, KEY_DELETED, KEY_MESSAGE_EXPIRY, KEY_MESSAGE_ID,
    KEY_MESSAGE_SENT, KEY_UNREAD,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::layout::{LayoutState, StoreLayout, CURRENT_LAYOUT_DIR};
use crate::{insert_record, open_writer, StoreOptions};

#[cfg(test)]
pub(crate) const LEGACY_SCHEMA_SQL: &str = r"
CREATE TABLE messages (
  message_id TEXT PRIMARY KEY,
  message_sent,
  message_expiry,
  unread INTEGER NOT NULL DEFAULT 1,
  deleted INTEGER NOT NULL DEFAULT 0,
  payload_json TEXT
);
";

const LEGACY_SIDE_FILES: [&str; 3] = ["-wal", "-shm", "-journal"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDegraded {
    pub reason: String,
}

/// How the current-layout store for a namespace came to be ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Legacy records were converted into the new store.
    Migrated { records: usize },
    /// No prior data existed; an empty store was created.
    FreshInit,
    /// The current layout was already present.
    NoOpReady,
    /// Legacy data could not be converted. The store is usable but empty.
    Degraded(MigrationDegraded),
}

impl MigrationOutcome {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    #[must_use]
    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Degraded(degraded) => Some(degraded.reason.as_str()),
            _ => None,
        }
    }
}

struct LegacyRow {
    message_id: SqlValue,
    message_sent: SqlValue,
    message_expiry: SqlValue,
    unread: SqlValue,
    deleted: SqlValue,
    payload_json: Option<String>,
}

/// Bring the namespace's store into the current layout and return its writer.
pub(crate) fn prepare_namespace(
    layout: &StoreLayout,
    namespace: &str,
    options: &StoreOptions,
) -> Result<(Connection, MigrationOutcome), StoreError> {
    let state = layout.detect(namespace);
    let path = layout.current_store_path(namespace);
    let open_failed = |err: &anyhow::Error| StoreError::Open {
        path: path.display().to_string(),
        reason: format!("{err:#}"),
    };

    fs::create_dir_all(layout.root().join(CURRENT_LAYOUT_DIR))
        .context("failed to create store directory")
        .map_err(|err| open_failed(&err))?;
    let mut conn = open_writer(&path, options).map_err(|err| open_failed(&err))?;

    let legacy_path = layout.legacy_store_path();
    let outcome = match state {
        LayoutState::Absent => MigrationOutcome::FreshInit,
        LayoutState::CurrentLayoutPresent if !legacy_path.is_file() => MigrationOutcome::NoOpReady,
        // An earlier open created the current store but stopped before retiring the
        // legacy file. Conversion commits in one transaction, so an empty store means
        // it never landed.
        LayoutState::CurrentLayoutPresent => {
            let stored = stored_records(&conn).map_err(|err| open_failed(&err))?;
            warn!(namespace, stored, legacy = %legacy_path.display(), "legacy message store left behind by an interrupted migration");
            if stored == 0 {
                migrate_legacy(&mut conn, namespace, &legacy_path)
            } else {
                retire_legacy(&legacy_path);
                MigrationOutcome::NoOpReady
            }
        }
        LayoutState::LegacyDetected => migrate_legacy(&mut conn, namespace, &legacy_path),
    };

    Ok((conn, outcome))
}

fn migrate_legacy(conn: &mut Connection, namespace: &str, legacy_path: &Path) -> MigrationOutcome {
    let outcome = match convert_legacy(conn, legacy_path) {
        Ok(records) => {
            info!(namespace, records, legacy = %legacy_path.display(), "migrated legacy message store");
            MigrationOutcome::Migrated { records }
        }
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(namespace, legacy = %legacy_path.display(), %reason, "legacy message store could not be migrated; starting empty");
            MigrationOutcome::Degraded(MigrationDegraded { reason })
        }
    };
    retire_legacy(legacy_path);
    outcome
}

fn stored_records(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .context("failed to count stored messages")
}

fn convert_legacy(conn: &mut Connection, legacy_path: &Path) -> Result<usize> {
    let rows = read_legacy_rows(legacy_path)?;

    let tx = conn.transaction().context("failed to start legacy conversion transaction")?;
    for (index, row) in rows.iter().enumerate() {
        let payload = legacy_payload(row).with_context(|| format!("legacy row {index}"))?;
        let message = InboundMessage::from_payload(&payload)
            .with_context(|| format!("legacy row {index} is not a valid message"))?;
        let id = message.id.clone();
        if let Some(failure) = insert_record(&tx, &message.into_record())? {
            return Err(anyhow!("legacy message {id} could not be inserted: {failure}"));
        }
    }
    tx.commit().context("failed to commit legacy conversion")?;
    Ok(rows.len())
}

fn read_legacy_rows(legacy_path: &Path) -> Result<Vec<LegacyRow>> {
    let legacy = Connection::open_with_flags(
        legacy_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open legacy store {}", legacy_path.display()))?;

    let mut stmt = legacy
        .prepare(
            "SELECT message_id, message_sent, message_expiry, unread, deleted, payload_json
             FROM messages",
        )
        .context("failed to read legacy messages table")?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LegacyRow {
            message_id: row.get(0)?,
            message_sent: row.get(1)?,
            message_expiry: row.get(2)?,
            unread: row.get(3)?,
            deleted: row.get(4)?,
            payload_json: row.get(5)?,
        });
    }
    Ok(out)
}

/// Rebuild the inbound payload shape: the stored JSON body with the legacy columns
/// laid over the control keys.
fn legacy_payload(row: &LegacyRow) -> Result<RawPayload> {
    let mut payload = match row.payload_json.as_deref() {
        None => RawPayload::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw).context("invalid payload_json")? {
            Value::Object(map) => map,
            Value::Null => RawPayload::new(),
            _ => return Err(anyhow!("payload_json is not an object")),
        },
    };

    payload.insert(KEY_MESSAGE_ID.to_string(), sql_to_json(&row.message_id)?);
    payload.insert(KEY_MESSAGE_SENT.to_string(), sql_to_json(&row.message_sent)?);
    payload.insert(KEY_MESSAGE_EXPIRY.to_string(), sql_to_json(&row.message_expiry)?);
    payload.insert(KEY_UNREAD.to_string(), sql_to_flag(&row.unread)?);
    payload.insert(KEY_DELETED.to_string(), sql_to_flag(&row.deleted)?);
    Ok(payload)
}

fn sql_to_json(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Integer(number) => Ok(Value::from(*number)),
        SqlValue::Text(text) => Ok(Value::String(text.clone())),
        SqlValue::Real(number) => serde_json::Number::from_f64(*number)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("non-finite number {number}")),
        SqlValue::Blob(_) => Err(anyhow!("unexpected blob column")),
    }
}

fn sql_to_flag(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Null => Ok(Value::Null),
        SqlValue::Integer(0) => Ok(Value::Bool(false)),
        SqlValue::Integer(1) => Ok(Value::Bool(true)),
        other => Err(anyhow!("unexpected flag value {other:?}")),
    }
}

fn retire_legacy(legacy_path: &Path) {
    let mut targets = vec![legacy_path.to_path_buf()];
    targets.extend(LEGACY_SIDE_FILES.iter().map(|suffix| side_file(legacy_path, suffix)));

    for target in targets {
        if !target.exists() {
            continue;
        }
        if let Err(err) = fs::remove_file(&target) {
            warn!(path = %target.display(), error = %err, "failed to remove legacy store file");
        }
    }
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
