//! SQLite-backed message store: one database file per namespace, a single
//! serialized writer, and pooled readers that see the last committed snapshot.

mod layout;
mod migration;
mod query;
mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use inbox_cache_core::{
    normalize_namespace, unix_nanos, BatchOp, BatchResult, CacheConfig, LocalFlags, MessageFilter,
    MessageId, MessageRecord, OpOutcome, RecordChange, ServerContent, SortOrder, StoreError,
    StoreWriteFailure,
};
use parking_lot::{Mutex, RwLock};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use layout::{LayoutState, StoreLayout, CURRENT_LAYOUT_DIR, LEGACY_STORE_FILE};
pub use migration::{MigrationDegraded, MigrationOutcome};
pub use schema::SchemaStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub reader_pool_size: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { reader_pool_size: 4, busy_timeout: Duration::from_millis(5_000) }
    }
}

impl From<&CacheConfig> for StoreOptions {
    fn from(config: &CacheConfig) -> Self {
        Self { reader_pool_size: config.reader_pool_size, busy_timeout: config.busy_timeout() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: u64,
    pub schema_status: SchemaStatus,
}

type ReaderPool = Pool<SqliteConnectionManager>;

/// Handle to one namespace's persisted message collection.
///
/// Writes are serialized through a single connection; reads go through a pool of
/// query-only connections and never observe a partially applied batch.
pub struct SqliteMessageStore {
    path: PathBuf,
    namespace: String,
    writer: Mutex<Option<Connection>>,
    readers: RwLock<Option<ReaderPool>>,
    migration: MigrationOutcome,
}

impl SqliteMessageStore {
    /// Open (creating if absent) the store for `namespace` under `layout`, running
    /// the legacy-layout migration first when one is detected.
    ///
    /// # Errors
    /// Returns [`StoreError::Open`] when the namespace is unusable or the store file
    /// cannot be opened, migrated, or passes no integrity check.
    pub fn open(
        layout: &StoreLayout,
        namespace: &str,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        let namespace = normalize_namespace(namespace).map_err(|err| StoreError::Open {
            path: layout.root().display().to_string(),
            reason: err.to_string(),
        })?;
        check_options(layout.root(), options)?;
        let path = layout.current_store_path(&namespace);
        let (writer, migration) = migration::prepare_namespace(layout, &namespace, options)?;
        Self::from_writer(path, namespace, writer, migration, options)
    }

    /// Open a store file directly, bypassing layout detection and legacy migration.
    ///
    /// # Errors
    /// Returns [`StoreError::Open`] when the file cannot be opened or migrated.
    pub fn open_path(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        check_options(path, options)?;
        let existed = path.is_file();
        let writer = open_writer(path, options).map_err(|err| open_error(path, &err))?;
        let namespace = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let migration =
            if existed { MigrationOutcome::NoOpReady } else { MigrationOutcome::FreshInit };
        Self::from_writer(path.to_path_buf(), namespace, writer, migration, options)
    }

    fn from_writer(
        path: PathBuf,
        namespace: String,
        writer: Connection,
        migration: MigrationOutcome,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        let readers = build_reader_pool(&path, options).map_err(|err| open_error(&path, &err))?;
        info!(namespace = %namespace, path = %path.display(), ?migration, "opened message store");
        Ok(Self {
            path,
            namespace,
            writer: Mutex::new(Some(writer)),
            readers: RwLock::new(Some(readers)),
            migration,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// How this store's on-disk layout was prepared when it was opened.
    #[must_use]
    pub fn migration_outcome(&self) -> &MigrationOutcome {
        &self.migration
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Materialize every record matching `filter` from the last committed snapshot.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after [`SqliteMessageStore::close`], or
    /// [`StoreError::Medium`] when rows cannot be read or decoded.
    pub fn fetch(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let guard = self.readers.read();
        let pool = guard.as_ref().ok_or(StoreError::Closed)?;
        let conn = pool.get().map_err(|err| StoreError::Medium(err.to_string()))?;
        fetch_records(&conn, filter, order).map_err(|err| medium(&err))
    }

    /// Apply all operations in one write transaction.
    ///
    /// Operations that target a missing id (or insert an existing one) are reported
    /// as failed in the returned [`BatchResult`]; the rest still commit. Any other
    /// failure rolls the whole batch back.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after close, or [`StoreError::Medium`] when the
    /// transaction cannot be committed.
    pub fn apply_batch(&self, ops: &[BatchOp]) -> Result<BatchResult, StoreError> {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        if ops.is_empty() {
            return Ok(BatchResult::default());
        }

        let result = apply_ops(conn, ops).map_err(|err| medium(&err))?;
        let failed = result.outcomes.iter().filter(|outcome| !outcome.is_applied()).count();
        if failed > 0 {
            warn!(namespace = %self.namespace, failed, total = ops.len(), "batch committed with failed operations");
        } else {
            debug!(namespace = %self.namespace, total = ops.len(), "batch committed");
        }
        Ok(result)
    }

    /// # Errors
    /// Returns [`StoreError::Closed`] after close, or [`StoreError::Medium`] when the
    /// schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        let guard = self.writer.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        schema::schema_status(conn).map_err(|err| medium(&err))
    }

    /// Run `PRAGMA quick_check` and count stored records.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after close, or [`StoreError::Medium`] when the
    /// checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let guard = self.writer.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        integrity_report(conn).map_err(|err| medium(&err))
    }

    /// Release the writer connection and the reader pool.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] when the store was already closed, or
    /// [`StoreError::Medium`] when SQLite refuses to close the writer.
    pub fn close(&self) -> Result<(), StoreError> {
        let writer = self.writer.lock().take();
        let readers = self.readers.write().take();
        let Some(writer) = writer else {
            return Err(StoreError::Closed);
        };
        drop(readers);
        writer.close().map_err(|(_, err)| StoreError::Medium(err.to_string()))?;
        info!(namespace = %self.namespace, "closed message store");
        Ok(())
    }
}

pub(crate) fn open_writer(path: &Path, options: &StoreOptions) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.busy_timeout(options.busy_timeout).context("failed to set busy timeout")?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )
    .context("failed to configure sqlite pragmas")?;

    schema::migrate(&mut conn)?;

    let report = integrity_report(&conn)?;
    if !report.quick_check_ok {
        return Err(anyhow!("integrity check failed: {}", report.quick_check_message));
    }

    Ok(conn)
}

fn check_options(path: &Path, options: &StoreOptions) -> Result<(), StoreError> {
    if options.reader_pool_size == 0 {
        return Err(StoreError::Open {
            path: path.display().to_string(),
            reason: "reader_pool_size MUST be >= 1".to_string(),
        });
    }
    Ok(())
}

fn build_reader_pool(path: &Path, options: &StoreOptions) -> Result<ReaderPool> {
    let busy_timeout = options.busy_timeout;
    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA query_only = ON;")
    });
    Pool::builder()
        .max_size(options.reader_pool_size)
        .build(manager)
        .context("failed to build reader connection pool")
}

fn integrity_report(conn: &Connection) -> Result<IntegrityReport> {
    let quick_check_message: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("failed to run quick_check")?;
    let record_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .context("failed to count messages")?;

    Ok(IntegrityReport {
        quick_check_ok: quick_check_message == "ok",
        quick_check_message,
        record_count: u64::try_from(record_count).unwrap_or_default(),
        schema_status: schema::schema_status(conn)?,
    })
}

fn fetch_records(
    conn: &Connection,
    filter: &MessageFilter,
    order: SortOrder,
) -> Result<Vec<MessageRecord>> {
    let clause = query::filter_clause(filter)?;
    let (where_sql, params) = match &clause {
        Some(clause) => (clause.sql.as_str(), clause.params.as_slice()),
        None => ("1 = 1", &[][..]),
    };

    let sql = format!(
        "SELECT {} FROM messages WHERE {where_sql} {}",
        query::SELECT_COLUMNS,
        query::order_by(order)
    );
    let mut stmt = conn.prepare(&sql).context("failed to prepare message query")?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(query::decode_row(row)?);
    }

    if clause.is_none() {
        records.retain(|record| filter.matches(record));
    }
    Ok(records)
}

fn apply_ops(conn: &mut Connection, ops: &[BatchOp]) -> Result<BatchResult> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start write transaction")?;

    let mut result = BatchResult { outcomes: Vec::with_capacity(ops.len()) };
    for op in ops {
        let failure = match op {
            BatchOp::Insert(record) => insert_record(&tx, record)?,
            BatchOp::Update { id, change } => update_record(&tx, id, change)?,
            BatchOp::Delete(id) => delete_record(&tx, id)?,
        };
        result.outcomes.push(OpOutcome { id: op.id().clone(), kind: op.kind(), failure });
    }

    tx.commit().context("failed to commit write transaction")?;
    Ok(result)
}

pub(crate) fn insert_record(
    conn: &Connection,
    record: &MessageRecord,
) -> Result<Option<StoreWriteFailure>> {
    let changed = conn
        .execute(
            "INSERT INTO messages(
                message_id, sent_at_ns, expires_at_ns, body_json,
                payload_hash, unread, deleted, orphaned_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(message_id) DO NOTHING",
            params![
                record.id.as_str(),
                unix_nanos("sent_at", record.sent_at)?,
                optional_nanos("expires_at", record.expires_at)?,
                serde_json::to_string(&record.body_fields).context("failed to serialize body")?,
                record.raw_payload_hash,
                record.unread,
                record.deleted,
                optional_nanos("orphaned_at", record.orphaned_at)?,
            ],
        )
        .with_context(|| format!("failed to insert message {}", record.id))?;

    Ok((changed == 0).then_some(StoreWriteFailure::AlreadyExists))
}

fn update_record(
    conn: &Connection,
    id: &MessageId,
    change: &RecordChange,
) -> Result<Option<StoreWriteFailure>> {
    let changed = match change {
        RecordChange::Content(content) => update_content(conn, id, content)?,
        RecordChange::Flags(flags) => update_flags(conn, id, *flags)?,
        RecordChange::Orphaned(orphaned_at) => conn
            .execute(
                "UPDATE messages SET orphaned_at_ns = ?1 WHERE message_id = ?2",
                params![optional_nanos("orphaned_at", *orphaned_at)?, id.as_str()],
            )
            .with_context(|| format!("failed to update orphan state of message {id}"))?,
    };

    Ok((changed == 0).then_some(StoreWriteFailure::NotFound))
}

fn update_content(conn: &Connection, id: &MessageId, content: &ServerContent) -> Result<usize> {
    conn.execute(
        "UPDATE messages SET
            sent_at_ns = ?1,
            expires_at_ns = ?2,
            body_json = ?3,
            payload_hash = ?4,
            deleted = CASE WHEN ?5 THEN 1 ELSE deleted END,
            orphaned_at_ns = NULL
         WHERE message_id = ?6",
        params![
            unix_nanos("sent_at", content.sent_at)?,
            optional_nanos("expires_at", content.expires_at)?,
            serde_json::to_string(&content.body_fields).context("failed to serialize body")?,
            content.raw_payload_hash,
            content.server_deleted,
            id.as_str(),
        ],
    )
    .with_context(|| format!("failed to update content of message {id}"))
}

fn update_flags(conn: &Connection, id: &MessageId, flags: LocalFlags) -> Result<usize> {
    conn.execute(
        "UPDATE messages SET
            unread = COALESCE(?1, unread),
            deleted = COALESCE(?2, deleted)
         WHERE message_id = ?3",
        params![flags.unread, flags.deleted, id.as_str()],
    )
    .with_context(|| format!("failed to update flags of message {id}"))
}

fn delete_record(conn: &Connection, id: &MessageId) -> Result<Option<StoreWriteFailure>> {
    let changed = conn
        .execute("DELETE FROM messages WHERE message_id = ?1", params![id.as_str()])
        .with_context(|| format!("failed to delete message {id}"))?;
    Ok((changed == 0).then_some(StoreWriteFailure::NotFound))
}

fn optional_nanos(
    field: &'static str,
    value: Option<time::OffsetDateTime>,
) -> Result<Option<i64>> {
    Ok(value.map(|value| unix_nanos(field, value)).transpose()?)
}

fn open_error(path: &Path, err: &anyhow::Error) -> StoreError {
    StoreError::Open { path: path.display().to_string(), reason: format!("{err:#}") }
}

fn medium(err: &anyhow::Error) -> StoreError {
    StoreError::Medium(format!("{err:#}"))
}
