use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::batch::{BatchOp, BatchResult, RecordChange, ServerContent};
use crate::error::PayloadError;
use crate::payload::{InboundMessage, RawPayload, KEY_MESSAGE_ID};
use crate::record::{MessageId, MessageRecord};

pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReconcilePolicy {
    /// How long an orphaned record may stay absent from authoritative batches
    /// before it is deleted anyway.
    pub orphan_grace: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self { orphan_grace: DEFAULT_ORPHAN_GRACE }
    }
}

/// Why a planned operation exists; parallel to [`ReconcilePlan::ops`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PlannedChange {
    Insert,
    Update,
    ClearOrphan,
    FlagOrphan,
    Delete,
    Expire,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedPayload {
    /// Position in the inbound batch.
    pub index: usize,
    /// Identity, when the payload carried a readable one.
    pub id: Option<MessageId>,
    pub error: PayloadError,
}

/// An optional key dropped from an otherwise accepted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredField {
    pub index: usize,
    pub id: MessageId,
    pub error: PayloadError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub ops: Vec<BatchOp>,
    pub changes: Vec<PlannedChange>,
    pub rejected: Vec<RejectedPayload>,
    pub ignored_fields: Vec<IgnoredField>,
    pub duplicate: usize,
    pub unchanged: usize,
    /// Payloads that arrived already expired and were never inserted.
    pub expired_skipped: usize,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(&mut self, op: BatchOp, change: PlannedChange) {
        self.ops.push(op);
        self.changes.push(change);
    }
}

/// Diff an authoritative payload batch against the current records of one store.
///
/// The plan never touches local flags except through a server-side delete marker,
/// and it never deletes a record that is newer than `source_timestamp` until the
/// orphan grace period has elapsed.
#[must_use]
pub fn plan_reconcile(
    existing: &[MessageRecord],
    payloads: &[RawPayload],
    source_timestamp: OffsetDateTime,
    policy: ReconcilePolicy,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let mut parsed = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.iter().enumerate() {
        match InboundMessage::from_payload(payload) {
            Ok(message) => {
                plan.ignored_fields.extend(message.ignored_fields.iter().map(|error| {
                    IgnoredField { index, id: message.id.clone(), error: error.clone() }
                }));
                parsed.push(message);
            }
            Err(error) => plan.rejected.push(RejectedPayload {
                index,
                id: readable_id(payload),
                error,
            }),
        }
    }

    // Later occurrences win; walk backwards and keep the first sighting.
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::with_capacity(parsed.len());
    for message in parsed.into_iter().rev() {
        if seen.insert(message.id.clone()) {
            candidates.push(message);
        } else {
            plan.duplicate += 1;
        }
    }
    candidates.reverse();

    let current: BTreeMap<&MessageId, &MessageRecord> =
        existing.iter().map(|record| (&record.id, record)).collect();

    for candidate in candidates {
        let stored = current.get(&candidate.id).copied();
        let expired = candidate.expires_at.is_some_and(|expires_at| expires_at <= source_timestamp);

        match stored {
            None if expired => plan.expired_skipped += 1,
            None => plan.push(BatchOp::Insert(candidate.into_record()), PlannedChange::Insert),
            Some(_) if expired => {
                plan.push(BatchOp::Delete(candidate.id), PlannedChange::Expire);
            }
            Some(record) if record.raw_payload_hash != candidate.raw_payload_hash => {
                let id = candidate.id.clone();
                plan.push(
                    BatchOp::Update { id, change: RecordChange::Content(ServerContent::from(candidate)) },
                    PlannedChange::Update,
                );
            }
            Some(record) => {
                plan.unchanged += 1;
                if record.is_orphaned() {
                    plan.push(
                        BatchOp::Update { id: candidate.id, change: RecordChange::Orphaned(None) },
                        PlannedChange::ClearOrphan,
                    );
                }
            }
        }
    }

    let protected: BTreeSet<MessageId> =
        plan.rejected.iter().filter_map(|rejected| rejected.id.clone()).collect();

    for (id, record) in current {
        if seen.contains(id) || protected.contains(id) {
            continue;
        }

        if record.is_expired_at(source_timestamp) {
            plan.push(BatchOp::Delete(id.clone()), PlannedChange::Expire);
        } else if record.sent_at > source_timestamp {
            match record.orphaned_at {
                None => plan.push(
                    BatchOp::Update {
                        id: id.clone(),
                        change: RecordChange::Orphaned(Some(source_timestamp)),
                    },
                    PlannedChange::FlagOrphan,
                ),
                Some(orphaned_at) if source_timestamp - orphaned_at >= policy.orphan_grace => {
                    plan.push(BatchOp::Delete(id.clone()), PlannedChange::Delete);
                }
                Some(_) => {}
            }
        } else {
            plan.push(BatchOp::Delete(id.clone()), PlannedChange::Delete);
        }
    }

    plan
}

fn readable_id(payload: &RawPayload) -> Option<MessageId> {
    match payload.get(KEY_MESSAGE_ID) {
        Some(Value::String(raw)) => MessageId::parse(raw).ok(),
        _ => None,
    }
}

/// Outcome of one reconcile pass, as reported to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub malformed: usize,
    pub unchanged: usize,
    pub duplicate: usize,
    /// Records newly flagged orphaned during this pass.
    pub orphaned: usize,
    pub expired: usize,
    /// Identities whose operation failed at the store layer.
    pub failed_ids: Vec<MessageId>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn from_plan(plan: &ReconcilePlan, result: &BatchResult) -> Self {
        let mut summary = Self {
            malformed: plan.rejected.len(),
            unchanged: plan.unchanged,
            duplicate: plan.duplicate,
            expired: plan.expired_skipped,
            failed_ids: result.failed_ids(),
            ..Self::default()
        };

        for (change, outcome) in plan.changes.iter().zip(&result.outcomes) {
            if !outcome.is_applied() {
                continue;
            }
            match change {
                PlannedChange::Insert => summary.inserted += 1,
                PlannedChange::Update => summary.updated += 1,
                PlannedChange::ClearOrphan => {}
                PlannedChange::FlagOrphan => summary.orphaned += 1,
                PlannedChange::Delete => summary.deleted += 1,
                PlannedChange::Expire => summary.expired += 1,
            }
        }

        summary
    }

    #[must_use]
    pub fn wrote_anything(&self) -> bool {
        self.inserted + self.updated + self.deleted + self.orphaned + self.expired > 0
    }
}
