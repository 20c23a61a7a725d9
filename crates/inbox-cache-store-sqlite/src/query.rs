use anyhow::{anyhow, Context, Result};
use inbox_cache_core::{
    clamp_to_persisted, from_unix_nanos, unix_nanos, BodyFields, MessageFilter, MessageId,
    MessageRecord, SortOrder,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::Row;

pub(crate) const SELECT_COLUMNS: &str = "message_id, sent_at_ns, expires_at_ns, body_json, \
     payload_hash, unread, deleted, orphaned_at_ns";

/// A `WHERE` fragment with positional `?` parameters.
#[derive(Debug, Default)]
pub(crate) struct SqlClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Translate a field-only filter into SQL. Returns `None` when the tree contains a
/// custom predicate and must be evaluated on materialized records instead.
pub(crate) fn filter_clause(filter: &MessageFilter) -> Result<Option<SqlClause>> {
    if filter.has_custom() {
        return Ok(None);
    }
    let mut clause = SqlClause::default();
    push_clause(filter, &mut clause)?;
    Ok(Some(clause))
}

fn push_clause(filter: &MessageFilter, clause: &mut SqlClause) -> Result<()> {
    match filter {
        MessageFilter::All => clause.sql.push_str("1 = 1"),
        MessageFilter::Unread => clause.sql.push_str("unread = 1"),
        MessageFilter::Deleted => clause.sql.push_str("deleted = 1"),
        MessageFilter::Orphaned => clause.sql.push_str("orphaned_at_ns IS NOT NULL"),
        MessageFilter::ExpiredAt(as_of) => {
            clause.sql.push_str("(expires_at_ns IS NOT NULL AND expires_at_ns <= ?)");
            let as_of = clamp_to_persisted(*as_of);
            clause.params.push(SqlValue::Integer(unix_nanos("expires_at", as_of)?));
        }
        MessageFilter::SentBetween { from, to } => {
            clause.sql.push_str("(sent_at_ns BETWEEN ? AND ?)");
            for bound in [from, to] {
                let bound = clamp_to_persisted(*bound);
                clause.params.push(SqlValue::Integer(unix_nanos("sent_at", bound)?));
            }
        }
        MessageFilter::Ids(ids) => {
            if ids.is_empty() {
                clause.sql.push_str("0 = 1");
            } else {
                let placeholders = vec!["?"; ids.len()].join(", ");
                clause.sql.push_str(&format!("message_id IN ({placeholders})"));
                clause
                    .params
                    .extend(ids.iter().map(|id| SqlValue::Text(id.as_str().to_string())));
            }
        }
        MessageFilter::And(parts) => push_joined(parts, " AND ", "1 = 1", clause)?,
        MessageFilter::Or(parts) => push_joined(parts, " OR ", "0 = 1", clause)?,
        MessageFilter::Not(inner) => {
            clause.sql.push_str("NOT (");
            push_clause(inner, clause)?;
            clause.sql.push(')');
        }
        MessageFilter::Custom(_) => {
            return Err(anyhow!("custom predicates cannot be translated to SQL"));
        }
    }
    Ok(())
}

fn push_joined(
    parts: &[MessageFilter],
    separator: &str,
    empty: &str,
    clause: &mut SqlClause,
) -> Result<()> {
    if parts.is_empty() {
        clause.sql.push_str(empty);
        return Ok(());
    }
    clause.sql.push('(');
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            clause.sql.push_str(separator);
        }
        push_clause(part, clause)?;
    }
    clause.sql.push(')');
    Ok(())
}

pub(crate) fn order_by(order: SortOrder) -> &'static str {
    match order {
        SortOrder::SentAtDesc => "ORDER BY sent_at_ns DESC, message_id ASC",
        SortOrder::SentAtAsc => "ORDER BY sent_at_ns ASC, message_id ASC",
    }
}

pub(crate) fn decode_row(row: &Row<'_>) -> Result<MessageRecord> {
    let id_raw: String = row.get(0)?;
    let id = MessageId::parse(&id_raw).with_context(|| format!("invalid stored id {id_raw:?}"))?;
    let body_json: String = row.get(3)?;
    let body_fields: BodyFields = serde_json::from_str(&body_json)
        .with_context(|| format!("failed to deserialize body of message {id}"))?;

    Ok(MessageRecord {
        sent_at: from_unix_nanos("sent_at", row.get(1)?)?,
        expires_at: row
            .get::<_, Option<i64>>(2)?
            .map(|nanos| from_unix_nanos("expires_at", nanos))
            .transpose()?,
        body_fields,
        raw_payload_hash: row.get(4)?,
        unread: row.get(5)?,
        deleted: row.get(6)?,
        orphaned_at: row
            .get::<_, Option<i64>>(7)?
            .map(|nanos| from_unix_nanos("orphaned_at", nanos))
            .transpose()?,
        id,
    })
}
