//! Domain model for the inbox message cache: records, inbound payload validation,
//! typed filters, batch operations, and the pure reconcile planner.

mod batch;
mod config;
mod error;
mod filter;
mod payload;
mod reconcile;
mod record;

pub use batch::{
    BatchOp, BatchResult, LocalFlags, OpKind, OpOutcome, RecordChange, ServerContent,
};
pub use config::{normalize_namespace, CacheConfig};
pub use error::{ConfigError, PayloadError, StoreError, StoreWriteFailure};
pub use filter::{FieldPredicate, ListOptions, MessageFilter, SortOrder};
pub use payload::{
    parse_timestamp, parse_timestamp_str, payload_hash, InboundMessage, RawPayload,
    KEY_DELETED, KEY_MESSAGE_EXPIRY, KEY_MESSAGE_ID, KEY_MESSAGE_SENT, KEY_UNREAD,
};
pub use reconcile::{
    plan_reconcile, IgnoredField, PlannedChange, ReconcilePlan, ReconcilePolicy,
    ReconcileSummary, RejectedPayload, DEFAULT_ORPHAN_GRACE,
};
pub use record::{
    clamp_to_persisted, from_unix_nanos, unix_nanos, BodyFields, MessageId, MessageRecord,
};
