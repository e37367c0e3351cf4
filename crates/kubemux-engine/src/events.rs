use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Per-session typed event channels.
///
/// One subscriber per session id; subscribing again replaces the previous
/// channel. Dropping the receiver cancels the subscription, and events for
/// sessions with no subscriber are discarded.
pub struct EventHub<E> {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<E>>>,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events for a session, replacing any prior subscription
    pub fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(session_id.to_string(), tx);
        rx
    }

    /// Deliver an event to the session's subscriber, if any.
    ///
    /// A closed receiver is pruned on the next emit.
    pub fn emit(&self, session_id: &str, event: E) {
        let mut senders = self.senders.lock();
        if let Some(tx) = senders.get(session_id) {
            if tx.send(event).is_err() {
                senders.remove(session_id);
            }
        }
    }

    /// Drop the session's subscription channel
    pub fn remove(&self, session_id: &str) {
        self.senders.lock().remove(session_id);
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_subscriber() {
        let hub: EventHub<u32> = EventHub::new();
        let mut rx = hub.subscribe("a");
        hub.emit("a", 7);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_emit_without_subscriber_is_dropped() {
        let hub: EventHub<u32> = EventHub::new();
        hub.emit("nobody", 1);
    }

    #[test]
    fn test_resubscribe_replaces_channel() {
        let hub: EventHub<u32> = EventHub::new();
        let mut old = hub.subscribe("a");
        let mut new = hub.subscribe("a");
        hub.emit("a", 9);
        assert!(old.try_recv().is_err());
        assert_eq!(new.try_recv().unwrap(), 9);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let hub: EventHub<u32> = EventHub::new();
        drop(hub.subscribe("a"));
        hub.emit("a", 1);
        assert!(hub.senders.lock().is_empty());
    }
}
