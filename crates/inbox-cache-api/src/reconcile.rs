use std::sync::Arc;

use inbox_cache_core::{
    plan_reconcile, MessageFilter, RawPayload, ReconcilePolicy, ReconcileSummary, SortOrder,
    StoreError,
};
use inbox_cache_store_sqlite::SqliteMessageStore;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::events::{ChangeSource, InboxEvent, InboxEvents};

/// Converges one namespace's store to each authoritative payload batch it is given.
pub struct Reconciler {
    store: Arc<SqliteMessageStore>,
    policy: ReconcilePolicy,
    events: Arc<InboxEvents>,
    // Plan and apply must not interleave with another pass.
    gate: Mutex<()>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<SqliteMessageStore>,
        policy: ReconcilePolicy,
        events: Arc<InboxEvents>,
    ) -> Self {
        Self { store, policy, events, gate: Mutex::new(()) }
    }

    #[must_use]
    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Diff `payloads` against the stored records and apply the result as a single
    /// batch. `source_timestamp` is when the server produced the batch.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the store is closed or the batch cannot be
    /// committed. Malformed payloads are counted, never returned as errors.
    pub fn apply(
        &self,
        payloads: &[RawPayload],
        source_timestamp: OffsetDateTime,
    ) -> Result<ReconcileSummary, StoreError> {
        let _pass = self.gate.lock();

        let existing = self.store.fetch(&MessageFilter::All, SortOrder::SentAtDesc)?;
        let plan = plan_reconcile(&existing, payloads, source_timestamp, self.policy);
        for rejected in &plan.rejected {
            warn!(
                namespace = self.store.namespace(),
                index = rejected.index,
                id = rejected.id.as_ref().map(|id| id.as_str()),
                error = %rejected.error,
                "dropping malformed payload"
            );
        }
        for ignored in &plan.ignored_fields {
            warn!(
                namespace = self.store.namespace(),
                index = ignored.index,
                id = ignored.id.as_str(),
                error = %ignored.error,
                "ignoring unreadable optional field"
            );
        }

        let result = self.store.apply_batch(&plan.ops)?;
        let summary = ReconcileSummary::from_plan(&plan, &result);

        info!(
            namespace = self.store.namespace(),
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            malformed = summary.malformed,
            unchanged = summary.unchanged,
            duplicate = summary.duplicate,
            orphaned = summary.orphaned,
            expired = summary.expired,
            failed = summary.failed_ids.len(),
            "reconcile pass complete"
        );

        if summary.wrote_anything() {
            self.events.publish(&InboxEvent::Changed(ChangeSource::Reconciled(summary.clone())));
        }
        Ok(summary)
    }
}
