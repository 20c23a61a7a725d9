use thiserror::Error;

/// Reasons an inbound payload is rejected before it can become a record.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum PayloadError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("message_id MUST be a non-empty string")]
    EmptyId,
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Per-operation failure inside an otherwise committed batch.
#[derive(Debug, Clone, Copy, Error, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreWriteFailure {
    #[error("a record with this id already exists")]
    AlreadyExists,
    #[error("no record with this id exists")]
    NotFound,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("failed to open message store at {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("message store is closed")]
    Closed,
    #[error("message store medium failure: {0}")]
    Medium(String),
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
