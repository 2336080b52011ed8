// Event bus for the UI subscriber

//! Single-subscriber event publication
//!
//! At most one listener is registered at a time; subscribing again replaces
//! (and closes) the previous stream. Publication never blocks: events go
//! through a bounded channel with `try_send` and are dropped when no one is
//! listening or the listener has fallen behind.

use crate::types::Event;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Default depth of the subscriber channel
pub const DEFAULT_CAPACITY: usize = 64;

/// Handle to the event bus (cheap to clone)
#[derive(Clone, Default)]
pub struct EventBus {
    slot: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
}

impl EventBus {
    /// Create a bus with no subscriber
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subscriber, replacing any previous one
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    /// Register the subscriber with an explicit channel depth
    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if self.lock().replace(tx).is_some() {
            log::debug!("Event subscriber replaced");
        }
        rx
    }

    /// Drop the current subscriber, if any
    pub fn unsubscribe(&self) {
        if self.lock().take().is_some() {
            log::debug!("Event subscriber removed");
        }
    }

    /// Whether a subscriber is attached and still listening
    pub fn has_subscriber(&self) -> bool {
        self.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver an event to the subscriber without waiting
    pub fn publish(&self, event: Event) {
        log::debug!("Event: {:?}", event);

        let mut slot = self.lock();
        let Some(tx) = slot.as_ref() else {
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event subscriber is not keeping up, dropped {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Event subscriber went away");
                *slot = None;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::Sender<Event>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;

    fn state(state: SessionState) -> Event {
        Event::StateChanged { state }
    }

    #[test]
    fn test_publish_without_subscriber() {
        let bus = EventBus::new();
        assert!(!bus.has_subscriber());
        bus.publish(state(SessionState::Connecting));
    }

    #[test]
    fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(state(SessionState::Connecting));
        bus.publish(state(SessionState::Connected));

        assert_eq!(rx.try_recv().unwrap(), state(SessionState::Connecting));
        assert_eq!(rx.try_recv().unwrap(), state(SessionState::Connected));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resubscribe_replaces_previous() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(state(SessionState::Connecting));

        // The first stream is closed and sees nothing
        assert_eq!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
        assert_eq!(second.try_recv().unwrap(), state(SessionState::Connecting));
    }

    #[test]
    fn test_unsubscribe_clears_slot() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.unsubscribe();
        assert!(!bus.has_subscriber());

        bus.publish(state(SessionState::Connecting));
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn test_full_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_with_capacity(1);

        bus.publish(state(SessionState::Connecting));
        bus.publish(state(SessionState::Connected));

        assert_eq!(rx.try_recv().unwrap(), state(SessionState::Connecting));
        assert!(rx.try_recv().is_err());
        assert!(bus.has_subscriber());
    }

    #[test]
    fn test_dropped_receiver_is_cleared() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        assert!(!bus.has_subscriber());

        bus.publish(state(SessionState::Connecting));
        assert!(bus.lock().is_none());
    }
}
