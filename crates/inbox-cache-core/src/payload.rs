use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::PayloadError;
use crate::record::{clamp_to_persisted, unix_nanos, BodyFields, MessageId, MessageRecord};

/// Untyped per-message mapping delivered by the network collaborator.
pub type RawPayload = Map<String, Value>;

pub const KEY_MESSAGE_ID: &str = "message_id";
pub const KEY_MESSAGE_SENT: &str = "message_sent";
pub const KEY_MESSAGE_EXPIRY: &str = "message_expiry";
pub const KEY_DELETED: &str = "deleted";
pub const KEY_UNREAD: &str = "unread";

const CONTROL_KEYS: [&str; 5] =
    [KEY_MESSAGE_ID, KEY_MESSAGE_SENT, KEY_MESSAGE_EXPIRY, KEY_DELETED, KEY_UNREAD];

/// A validated inbound payload, ready to be inserted or compared against a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub sent_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub body_fields: BodyFields,
    pub server_deleted: bool,
    /// Server view of the unread state. Only seeds the local flag on first insert.
    pub unread_hint: Option<bool>,
    pub raw_payload_hash: String,
    /// Optional keys that could not be interpreted and were treated as absent.
    pub ignored_fields: Vec<PayloadError>,
}

impl InboundMessage {
    /// Validate one raw payload.
    ///
    /// # Errors
    /// Returns [`PayloadError`] when `message_id` or `message_sent` is missing or
    /// malformed. Unreadable optional keys never reject the payload; they are
    /// dropped and listed in [`InboundMessage::ignored_fields`].
    pub fn from_payload(payload: &RawPayload) -> Result<Self, PayloadError> {
        let id = match payload.get(KEY_MESSAGE_ID) {
            None | Some(Value::Null) => return Err(PayloadError::MissingField(KEY_MESSAGE_ID)),
            Some(Value::String(raw)) => MessageId::parse(raw)?,
            Some(_) => {
                return Err(PayloadError::InvalidField {
                    field: KEY_MESSAGE_ID,
                    reason: "expected a string".to_string(),
                })
            }
        };

        let sent_at = match payload.get(KEY_MESSAGE_SENT) {
            None | Some(Value::Null) => return Err(PayloadError::MissingField(KEY_MESSAGE_SENT)),
            Some(value) => parse_timestamp(KEY_MESSAGE_SENT, value)?,
        };

        let mut ignored_fields = Vec::new();
        let expires_at = match payload.get(KEY_MESSAGE_EXPIRY) {
            None | Some(Value::Null) => None,
            Some(value) => match parse_timestamp(KEY_MESSAGE_EXPIRY, value) {
                Ok(parsed) => Some(clamp_to_persisted(parsed)),
                Err(error) => {
                    ignored_fields.push(error);
                    None
                }
            },
        };

        let server_deleted =
            lenient_bool(payload, KEY_DELETED, &mut ignored_fields).unwrap_or(false);
        let unread_hint = lenient_bool(payload, KEY_UNREAD, &mut ignored_fields);

        let body_fields: BodyFields = payload
            .iter()
            .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let raw_payload_hash =
            payload_hash(&id, sent_at, expires_at, &body_fields, server_deleted)?;

        Ok(Self {
            id,
            sent_at,
            expires_at,
            body_fields,
            server_deleted,
            unread_hint,
            raw_payload_hash,
            ignored_fields,
        })
    }

    /// Materialize a brand-new record for first sight of this id.
    #[must_use]
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            sent_at: self.sent_at,
            expires_at: self.expires_at,
            body_fields: self.body_fields,
            unread: self.unread_hint.unwrap_or(true),
            deleted: self.server_deleted,
            orphaned_at: None,
            raw_payload_hash: self.raw_payload_hash,
        }
    }
}

/// Booleans arrive as JSON bools, `0`/`1`, or their string spellings.
fn lenient_bool(
    payload: &RawPayload,
    key: &'static str,
    ignored: &mut Vec<PayloadError>,
) -> Option<bool> {
    let parsed = match payload.get(key)? {
        Value::Null => return None,
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };
    if parsed.is_none() {
        ignored.push(PayloadError::InvalidField { field: key, reason: "expected a boolean".to_string() });
    }
    parsed
}

/// Parse a server timestamp: RFC 3339 text, `YYYY-MM-DD HH:MM:SS` (UTC) text, or
/// integer unix seconds.
///
/// # Errors
/// Returns [`PayloadError::InvalidField`] when the value matches none of those shapes.
pub fn parse_timestamp(field: &'static str, value: &Value) -> Result<OffsetDateTime, PayloadError> {
    match value {
        Value::Number(number) => {
            let seconds = number.as_i64().ok_or_else(|| PayloadError::InvalidField {
                field,
                reason: format!("expected integer unix seconds, got {number}"),
            })?;
            OffsetDateTime::from_unix_timestamp(seconds)
                .map_err(|err| PayloadError::InvalidField { field, reason: err.to_string() })
        }
        Value::String(text) => parse_timestamp_str(field, text),
        _ => Err(PayloadError::InvalidField {
            field,
            reason: "expected a timestamp string or unix seconds".to_string(),
        }),
    }
}

/// Text form of [`parse_timestamp`].
///
/// # Errors
/// Returns [`PayloadError::InvalidField`] when the text is neither RFC 3339 nor
/// `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp_str(field: &'static str, text: &str) -> Result<OffsetDateTime, PayloadError> {
    let text = text.trim();
    if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    PrimitiveDateTime::parse(text, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| PayloadError::InvalidField {
            field,
            reason: format!("unrecognized timestamp {text:?}: {err}"),
        })
}

/// Digest of the server-authoritative content of one message.
///
/// Object keys are sorted at every depth so that key order in the wire payload
/// never changes the digest.
///
/// # Errors
/// Returns [`PayloadError::InvalidField`] when a timestamp cannot be encoded.
pub fn payload_hash(
    id: &MessageId,
    sent_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    body_fields: &BodyFields,
    server_deleted: bool,
) -> Result<String, PayloadError> {
    let expires_at_ns = match expires_at {
        Some(value) => Value::from(unix_nanos(KEY_MESSAGE_EXPIRY, value)?),
        None => Value::Null,
    };

    let body: Map<String, Value> =
        body_fields.iter().map(|(key, value)| (key.clone(), canonical(value))).collect();

    let mut envelope = Map::new();
    envelope.insert("body".to_string(), Value::Object(body));
    envelope.insert("deleted".to_string(), Value::Bool(server_deleted));
    envelope.insert("expires_at_ns".to_string(), expires_at_ns);
    envelope.insert("id".to_string(), Value::String(id.as_str().to_string()));
    envelope.insert("sent_at_ns".to_string(), Value::from(unix_nanos(KEY_MESSAGE_SENT, sent_at)?));

    let encoded = Value::Object(envelope).to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    Ok(format!("sha256:{}", hex::encode(digest)))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted.into_iter().map(|(key, value)| (key.clone(), canonical(value))).collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
