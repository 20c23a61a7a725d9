use flume::{Receiver, Sender};
use inbox_cache_core::ReconcileSummary;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Dismissal request raised by a detail view. The cache only forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub animated: bool,
}

/// Local mutation issued through the query interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    MarkRead,
    MarkUnread,
    MarkDeleted,
    Delete,
    PurgeDeleted,
    PurgeExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ChangeSource {
    Reconciled(ReconcileSummary),
    Mutated { kind: MutationKind, affected: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboxEvent {
    /// A write committed and query results may differ.
    Changed(ChangeSource),
    CloseRequested(CloseSignal),
}

/// Fan-out notification bus. Every subscriber gets its own unbounded channel;
/// dropped receivers are pruned on the next publish.
#[derive(Debug, Default)]
pub struct InboxEvents {
    subscribers: Mutex<Vec<Sender<InboxEvent>>>,
}

impl InboxEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<InboxEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn publish(&self, event: &InboxEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(subscribers = subscribers.len(), ?event, "published inbox event");
    }

    pub fn request_close(&self, animated: bool) {
        self.publish(&InboxEvent::CloseRequested(CloseSignal { animated }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_each_event() {
        let events = InboxEvents::new();
        let first = events.subscribe();
        let second = events.subscribe();

        events.request_close(true);

        let expected = InboxEvent::CloseRequested(CloseSignal { animated: true });
        assert_eq!(first.try_recv().ok(), Some(expected.clone()));
        assert_eq!(second.try_recv().ok(), Some(expected));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let events = InboxEvents::new();
        let kept = events.subscribe();
        drop(events.subscribe());
        assert_eq!(events.subscriber_count(), 2);

        events.publish(&InboxEvent::Changed(ChangeSource::Mutated {
            kind: MutationKind::MarkRead,
            affected: 1,
        }));
        assert_eq!(events.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
