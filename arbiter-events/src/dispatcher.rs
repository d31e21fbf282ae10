//! Typed event dispatch.
//!
//! Events go to two places: synchronous handlers registered per
//! [`EventKind`], and a broadcast channel for async subscribers. Publishing
//! never fails; a missing subscriber only means nobody is listening.

use arbiter_core::{
    ArbiterError, ArbiterResult, DomainEvent, Event, EventConfig, EventKind, StorageError,
    Timestamp,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Synchronous consumer of one or more event kinds.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

type HandlerTable = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

pub struct EventDispatcher {
    tx: broadcast::Sender<Event>,
    handlers: RwLock<HandlerTable>,
}

impl EventDispatcher {
    /// Create a dispatcher whose broadcast channel buffers `capacity` events
    /// before slow subscribers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    /// Register a handler for one kind.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> ArbiterResult<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ArbiterError::Storage(StorageError::LockPoisoned))?;
        handlers.entry(kind).or_default().push(handler);
        Ok(())
    }

    /// Register a handler for every kind.
    pub fn register_all(&self, handler: Arc<dyn EventHandler>) -> ArbiterResult<()> {
        for kind in EventKind::ALL {
            self.register(*kind, handler.clone())?;
        }
        Ok(())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Wrap the payload in an envelope, run handlers, then broadcast.
    pub fn publish(&self, payload: DomainEvent, now: Timestamp) -> Event {
        let event = Event::new(payload, now);

        let handlers = match self.handlers.read() {
            Ok(table) => table.get(&event.kind).cloned().unwrap_or_default(),
            Err(_) => {
                warn!(event_type = %event.kind, "Handler table poisoned, skipping handlers");
                Vec::new()
            }
        };
        for handler in &handlers {
            handler.handle(&event);
        }

        match self.tx.send(event.clone()) {
            Ok(receiver_count) => {
                debug!(
                    event_type = %event.kind,
                    handlers = handlers.len(),
                    receivers = receiver_count,
                    "Published event"
                );
            }
            Err(_) => {
                debug!(event_type = %event.kind, handlers = handlers.len(), "No receivers for event");
            }
        }
        event
    }

    /// Subscribe to every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::from_config(&EventConfig::default())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{DecisionId, EntityIdType, ProposalId};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn executed() -> DomainEvent {
        DomainEvent::DecisionExecuted {
            decision_id: DecisionId::now_v7(),
            proposal_id: ProposalId::now_v7(),
        }
    }

    #[test]
    fn test_handlers_only_see_their_kind() {
        let dispatcher = EventDispatcher::new(16);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dispatcher
            .register(
                EventKind::DecisionExecuted,
                Arc::new(move |_: &Event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        dispatcher.publish(executed(), Utc::now());
        dispatcher.publish(
            DomainEvent::PreferenceRolledBack {
                category: "coaching".to_string(),
                key: "tone".to_string(),
                restored_value: "gentle".into(),
                source: arbiter_core::RollbackSource::Decision(DecisionId::now_v7()),
                reason: "undo".to_string(),
            },
            Utc::now(),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_all_covers_every_kind() {
        let dispatcher = EventDispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .register_all(Arc::new(move |e: &Event| sink.lock().unwrap().push(e.kind)))
            .unwrap();
        for kind in EventKind::ALL {
            assert_eq!(dispatcher.handler_count(*kind), 1);
        }
        dispatcher.publish(executed(), Utc::now());
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::DecisionExecuted]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.subscribe();
        let published = dispatcher.publish(executed(), Utc::now());
        let received = rx.recv().await.unwrap();
        assert_eq!(received, published);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let dispatcher = EventDispatcher::new(1);
        let event = dispatcher.publish(executed(), Utc::now());
        assert_eq!(event.kind, EventKind::DecisionExecuted);
    }
}
