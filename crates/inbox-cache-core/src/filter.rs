use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use time::OffsetDateTime;

use crate::record::{MessageId, MessageRecord};

/// Arbitrary predicate over a materialized record.
#[derive(Clone)]
pub struct FieldPredicate(Arc<dyn Fn(&MessageRecord) -> bool + Send + Sync>);

impl FieldPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&MessageRecord) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    #[must_use]
    pub fn test(&self, record: &MessageRecord) -> bool {
        (self.0)(record)
    }
}

impl Debug for FieldPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldPredicate(..)")
    }
}

/// Typed, composable selection over stored records.
///
/// Variants other than [`MessageFilter::Custom`] only reference persisted columns,
/// so a store can evaluate them without materializing rows first.
#[derive(Debug, Clone, Default)]
pub enum MessageFilter {
    #[default]
    All,
    Unread,
    Deleted,
    Orphaned,
    /// Records whose expiry is at or before the given instant.
    ExpiredAt(OffsetDateTime),
    /// Inclusive on both ends.
    SentBetween { from: OffsetDateTime, to: OffsetDateTime },
    Ids(BTreeSet<MessageId>),
    And(Vec<MessageFilter>),
    Or(Vec<MessageFilter>),
    Not(Box<MessageFilter>),
    Custom(FieldPredicate),
}

impl MessageFilter {
    #[must_use]
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&MessageRecord) -> bool + Send + Sync + 'static,
    {
        Self::Custom(FieldPredicate::new(predicate))
    }

    #[must_use]
    pub fn and(self, other: MessageFilter) -> Self {
        match self {
            Self::All => other,
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            current => Self::And(vec![current, other]),
        }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn matches(&self, record: &MessageRecord) -> bool {
        match self {
            Self::All => true,
            Self::Unread => record.unread,
            Self::Deleted => record.deleted,
            Self::Orphaned => record.is_orphaned(),
            Self::ExpiredAt(as_of) => record.is_expired_at(*as_of),
            Self::SentBetween { from, to } => record.sent_at >= *from && record.sent_at <= *to,
            Self::Ids(ids) => ids.contains(&record.id),
            Self::And(parts) => parts.iter().all(|part| part.matches(record)),
            Self::Or(parts) => parts.iter().any(|part| part.matches(record)),
            Self::Not(inner) => !inner.matches(record),
            Self::Custom(predicate) => predicate.test(record),
        }
    }

    /// True when any node of the tree needs the in-memory record to evaluate.
    #[must_use]
    pub fn has_custom(&self) -> bool {
        match self {
            Self::Custom(_) => true,
            Self::And(parts) | Self::Or(parts) => parts.iter().any(Self::has_custom),
            Self::Not(inner) => inner.has_custom(),
            _ => false,
        }
    }
}

/// Listing order. Ties on `sent_at` always fall back to ascending id.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum SortOrder {
    #[default]
    SentAtDesc,
    SentAtAsc,
}

impl SortOrder {
    #[must_use]
    pub fn compare(self, lhs: &MessageRecord, rhs: &MessageRecord) -> Ordering {
        let by_sent = match self {
            Self::SentAtDesc => rhs.sent_at.cmp(&lhs.sent_at),
            Self::SentAtAsc => lhs.sent_at.cmp(&rhs.sent_at),
        };
        by_sent.then_with(|| lhs.id.cmp(&rhs.id))
    }
}

/// Default listing switches exposed to presentation collaborators.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ListOptions {
    pub unread_only: bool,
    pub include_deleted: bool,
}

impl ListOptions {
    #[must_use]
    pub fn to_filter(self) -> MessageFilter {
        let mut filter = MessageFilter::All;
        if !self.include_deleted {
            filter = filter.and(MessageFilter::Deleted.negate());
        }
        if self.unread_only {
            filter = filter.and(MessageFilter::Unread);
        }
        filter
    }
}
