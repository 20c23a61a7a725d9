use std::collections::BTreeSet;
use std::sync::Arc;

use inbox_cache_core::{
    BatchOp, BatchResult, ListOptions, LocalFlags, MessageFilter, MessageId, MessageRecord,
    OpKind, RecordChange, SortOrder, StoreError,
};
use inbox_cache_store_sqlite::SqliteMessageStore;
use time::OffsetDateTime;
use tracing::debug;

use crate::events::{ChangeSource, InboxEvent, InboxEvents, MutationKind};

/// Read access plus local-flag mutations for presentation collaborators.
#[derive(Clone)]
pub struct MessageQuery {
    store: Arc<SqliteMessageStore>,
    events: Arc<InboxEvents>,
}

impl MessageQuery {
    #[must_use]
    pub fn new(store: Arc<SqliteMessageStore>, events: Arc<InboxEvents>) -> Self {
        Self { store, events }
    }

    /// Newest first. Deleted records are hidden unless asked for.
    ///
    /// # Errors
    /// Propagates [`StoreError`] from the underlying fetch.
    pub fn list(&self, options: ListOptions) -> Result<Vec<MessageRecord>, StoreError> {
        self.store.fetch(&options.to_filter(), SortOrder::SentAtDesc)
    }

    /// # Errors
    /// Propagates [`StoreError`] from the underlying fetch.
    pub fn list_matching(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.store.fetch(filter, order)
    }

    /// Looks up a record regardless of its deleted flag.
    ///
    /// # Errors
    /// Propagates [`StoreError`] from the underlying fetch.
    pub fn get(&self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let filter = MessageFilter::Ids(BTreeSet::from([id.clone()]));
        Ok(self.store.fetch(&filter, SortOrder::SentAtDesc)?.into_iter().next())
    }

    /// Unread records that are not deleted.
    ///
    /// # Errors
    /// Propagates [`StoreError`] from the underlying fetch.
    pub fn unread_count(&self) -> Result<usize, StoreError> {
        let options = ListOptions { unread_only: true, include_deleted: false };
        Ok(self.list(options)?.len())
    }

    /// # Errors
    /// Propagates [`StoreError`]; an absent id is reported in the result.
    pub fn mark_read(&self, id: &MessageId) -> Result<BatchResult, StoreError> {
        self.update_flags(
            std::slice::from_ref(id),
            LocalFlags { unread: Some(false), deleted: None },
            MutationKind::MarkRead,
        )
    }

    /// # Errors
    /// Propagates [`StoreError`]; absent ids are reported in the result.
    pub fn mark_unread(&self, ids: &BTreeSet<MessageId>) -> Result<BatchResult, StoreError> {
        let ids: Vec<MessageId> = ids.iter().cloned().collect();
        self.update_flags(
            &ids,
            LocalFlags { unread: Some(true), deleted: None },
            MutationKind::MarkUnread,
        )
    }

    /// Soft delete: hides the records from default listings but keeps them stored.
    ///
    /// # Errors
    /// Propagates [`StoreError`]; absent ids are reported in the result.
    pub fn mark_deleted(&self, ids: &BTreeSet<MessageId>) -> Result<BatchResult, StoreError> {
        let ids: Vec<MessageId> = ids.iter().cloned().collect();
        self.update_flags(
            &ids,
            LocalFlags { unread: None, deleted: Some(true) },
            MutationKind::MarkDeleted,
        )
    }

    /// Remove records outright.
    ///
    /// # Errors
    /// Propagates [`StoreError`]; absent ids are reported in the result.
    pub fn delete(&self, ids: &BTreeSet<MessageId>) -> Result<BatchResult, StoreError> {
        let ops: Vec<BatchOp> = ids.iter().cloned().map(BatchOp::Delete).collect();
        self.commit(&ops, MutationKind::Delete)
    }

    /// Hard-delete every record whose deleted flag is set.
    ///
    /// # Errors
    /// Propagates [`StoreError`].
    pub fn purge_deleted(&self) -> Result<usize, StoreError> {
        self.purge(&MessageFilter::Deleted, MutationKind::PurgeDeleted)
    }

    /// Hard-delete every record that expired at or before `as_of`.
    ///
    /// # Errors
    /// Propagates [`StoreError`].
    pub fn purge_expired(&self, as_of: OffsetDateTime) -> Result<usize, StoreError> {
        self.purge(&MessageFilter::ExpiredAt(as_of), MutationKind::PurgeExpired)
    }

    fn purge(&self, filter: &MessageFilter, kind: MutationKind) -> Result<usize, StoreError> {
        let ops: Vec<BatchOp> = self
            .store
            .fetch(filter, SortOrder::SentAtDesc)?
            .into_iter()
            .map(|record| BatchOp::Delete(record.id))
            .collect();
        Ok(self.commit(&ops, kind)?.applied(OpKind::Delete))
    }

    fn update_flags(
        &self,
        ids: &[MessageId],
        flags: LocalFlags,
        kind: MutationKind,
    ) -> Result<BatchResult, StoreError> {
        let ops: Vec<BatchOp> = ids
            .iter()
            .map(|id| BatchOp::Update { id: id.clone(), change: RecordChange::Flags(flags) })
            .collect();
        self.commit(&ops, kind)
    }

    fn commit(&self, ops: &[BatchOp], kind: MutationKind) -> Result<BatchResult, StoreError> {
        let result = self.store.apply_batch(ops)?;
        let affected = result.outcomes.iter().filter(|outcome| outcome.is_applied()).count();
        debug!(namespace = self.store.namespace(), ?kind, requested = ops.len(), affected, "local mutation");
        if affected > 0 {
            self.events.publish(&InboxEvent::Changed(ChangeSource::Mutated { kind, affected }));
        }
        Ok(result)
    }
}
