//! Entry point for one namespace's message cache: opens (and if needed migrates)
//! the store, then hands out the reconciler, query interface, and event bus that
//! share it.

mod events;
mod query;
mod reconcile;

use std::sync::Arc;

use inbox_cache_core::{CacheConfig, ConfigError, StoreError};
use inbox_cache_store_sqlite::{
    MigrationOutcome, SqliteMessageStore, StoreLayout, StoreOptions,
};
use thiserror::Error;
use tracing::warn;

pub use events::{ChangeSource, CloseSignal, InboxEvent, InboxEvents, MutationKind};
pub use query::MessageQuery;
pub use reconcile::Reconciler;

#[derive(Debug, Error)]
pub enum CacheOpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct InboxCache {
    store: Arc<SqliteMessageStore>,
    events: Arc<InboxEvents>,
    reconciler: Arc<Reconciler>,
    query: MessageQuery,
}

impl InboxCache {
    /// Validate `config`, run the layout migration if needed, and open the store.
    ///
    /// A failed legacy conversion does not fail the open; it is reported through
    /// [`InboxCache::migration_outcome`].
    ///
    /// # Errors
    /// Returns [`CacheOpenError`] when the config is invalid or the store cannot be
    /// opened.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheOpenError> {
        config.validate()?;
        let layout = StoreLayout::new(&config.root_dir);
        let store = Arc::new(SqliteMessageStore::open(
            &layout,
            &config.namespace,
            &StoreOptions::from(config),
        )?);

        if let Some(reason) = store.migration_outcome().warning() {
            warn!(namespace = store.namespace(), reason, "message cache opened degraded");
        }

        let events = Arc::new(InboxEvents::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            config.reconcile_policy(),
            Arc::clone(&events),
        ));
        let query = MessageQuery::new(Arc::clone(&store), Arc::clone(&events));
        Ok(Self { store, events, reconciler, query })
    }

    #[must_use]
    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    #[must_use]
    pub fn query(&self) -> MessageQuery {
        self.query.clone()
    }

    #[must_use]
    pub fn events(&self) -> Arc<InboxEvents> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub fn store(&self) -> &SqliteMessageStore {
        &self.store
    }

    #[must_use]
    pub fn migration_outcome(&self) -> &MigrationOutcome {
        self.store.migration_outcome()
    }

    /// Close the underlying store. Every handle obtained from this cache fails with
    /// [`StoreError::Closed`] afterwards.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] when already closed.
    pub fn close(&self) -> Result<(), StoreError> {
        self.store.close()
    }
}
