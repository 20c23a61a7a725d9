use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreWriteFailure;
use crate::payload::InboundMessage;
use crate::record::{BodyFields, MessageId, MessageRecord};

/// Server-authoritative fields replaced wholesale by a reconcile update.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerContent {
    pub sent_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub body_fields: BodyFields,
    pub raw_payload_hash: String,
    /// Forces the local `deleted` flag on; never clears it.
    pub server_deleted: bool,
}

impl From<InboundMessage> for ServerContent {
    fn from(message: InboundMessage) -> Self {
        Self {
            sent_at: message.sent_at,
            expires_at: message.expires_at,
            body_fields: message.body_fields,
            raw_payload_hash: message.raw_payload_hash,
            server_deleted: message.server_deleted,
        }
    }
}

/// Local-owned flags. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LocalFlags {
    pub unread: Option<bool>,
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// Replace server content and clear any orphan flag.
    Content(ServerContent),
    Flags(LocalFlags),
    /// `Some` flags the record orphaned as of that instant, `None` clears the flag.
    Orphaned(Option<OffsetDateTime>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Insert(MessageRecord),
    Update { id: MessageId, change: RecordChange },
    Delete(MessageId),
}

impl BatchOp {
    #[must_use]
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Insert(record) => &record.id,
            Self::Update { id, .. } | Self::Delete(id) => id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Insert(_) => OpKind::Insert,
            Self::Update { .. } => OpKind::Update,
            Self::Delete(_) => OpKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OpOutcome {
    pub id: MessageId,
    pub kind: OpKind,
    pub failure: Option<StoreWriteFailure>,
}

impl OpOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.failure.is_none()
    }
}

/// Per-operation results of one committed batch, in submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchResult {
    pub outcomes: Vec<OpOutcome>,
}

impl BatchResult {
    #[must_use]
    pub fn applied(&self, kind: OpKind) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.kind == kind && outcome.is_applied()).count()
    }

    #[must_use]
    pub fn failed_ids(&self) -> Vec<MessageId> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_applied())
            .map(|outcome| outcome.id.clone())
            .collect()
    }

    #[must_use]
    pub fn all_applied(&self) -> bool {
        self.outcomes.iter().all(OpOutcome::is_applied)
    }
}
