//! Fan-out of inbound messages to any number of subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

use super::InboundMessage;

#[derive(Default)]
struct Registry {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<InboundMessage>>,
}

/// Shared list of subscriber channels.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, tx);

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every live subscriber; returns how many received it.
    pub fn dispatch(&self, message: InboundMessage) -> usize {
        let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        registry
            .senders
            .retain(|_, tx| tx.send(message.clone()).is_ok());
        registry.senders.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .senders
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of `on_message()`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .senders
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::messages::TransportMessage;
    use crate::transport::ConnectionId;

    fn inbound(kind: &str) -> InboundMessage {
        InboundMessage {
            message: TransportMessage::new(kind, serde_json::Value::Null),
            connection: ConnectionId::next(),
            sender_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let registry = HandlerRegistry::new();
        let mut a = registry.subscribe();
        let mut b = registry.subscribe();

        assert_eq!(registry.dispatch(inbound("one")), 2);
        assert_eq!(a.recv().await.unwrap().message.kind, "one");
        assert_eq!(b.recv().await.unwrap().message.kind, "one");
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_subscriber() {
        let registry = HandlerRegistry::new();
        let a = registry.subscribe();
        let b = registry.subscribe();
        assert_eq!(registry.len(), 2);

        a.unsubscribe();
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch(inbound("nobody")), 0);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = HandlerRegistry::new();
        let mut sub = registry.subscribe();
        drop(registry);
        assert!(sub.try_recv().is_none());
    }
}
