use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::PayloadError;

/// Server-assigned message identity. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    /// Build an identity from server-provided text.
    ///
    /// # Errors
    /// Returns [`PayloadError::EmptyId`] when the value is empty or whitespace-only.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        Self::try_from(raw.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = PayloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(PayloadError::EmptyId);
        }
        Ok(Self(value))
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body content and metadata exactly as the server delivered it.
pub type BodyFields = BTreeMap<String, Value>;

/// One cached inbox message.
///
/// `unread` and `deleted` are owned by the local presentation layer. Reconciliation
/// replaces every other field but leaves these alone, except that a server-side
/// delete marker forces `deleted` on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub body_fields: BodyFields,
    pub unread: bool,
    pub deleted: bool,
    /// Set when the record was missing from an authoritative batch but is newer
    /// than that batch. Holds the source timestamp of the pass that flagged it.
    #[serde(with = "time::serde::rfc3339::option")]
    pub orphaned_at: Option<OffsetDateTime>,
    pub raw_payload_hash: String,
}

impl MessageRecord {
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.orphaned_at.is_some()
    }

    #[must_use]
    pub fn is_expired_at(&self, as_of: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= as_of)
    }
}

/// Nanoseconds since the unix epoch, the persisted ordering key for timestamps.
///
/// # Errors
/// Returns [`PayloadError::InvalidField`] for timestamps outside the `i64` nanosecond range.
pub fn unix_nanos(field: &'static str, value: OffsetDateTime) -> Result<i64, PayloadError> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| PayloadError::InvalidField {
        field,
        reason: format!("{value} is outside the supported range"),
    })
}

/// Pull `value` into the range [`unix_nanos`] can persist (years 1677 to 2262).
///
/// Far-future sentinels such as `9999-12-31T23:59:59Z` stay later than any real
/// timestamp after clamping.
#[must_use]
pub fn clamp_to_persisted(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.unix_timestamp_nanos().clamp(i128::from(i64::MIN), i128::from(i64::MAX));
    OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(value)
}

/// Inverse of [`unix_nanos`].
///
/// # Errors
/// Returns [`PayloadError::InvalidField`] when the stored value is not a valid timestamp.
pub fn from_unix_nanos(field: &'static str, nanos: i64) -> Result<OffsetDateTime, PayloadError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        PayloadError::InvalidField { field, reason: err.to_string() }
    })
}
