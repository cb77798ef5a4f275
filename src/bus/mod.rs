//! In-process message bus.
//!
//! Each endpoint owns a bounded inbox. Delivery is FIFO per sender and
//! recipient; nothing orders messages from distinct senders. A send waits for
//! inbox capacity for at most the configured timeout and never retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::BusConfig;
use crate::error::{MeshError, Result};
use crate::protocol::{Endpoint, Message, NodeId};

/// Stream of messages addressed to one endpoint.
pub type Subscription = ReceiverStream<Message>;

#[derive(Clone)]
pub struct MessageBus {
    inboxes: Arc<RwLock<HashMap<Endpoint, mpsc::Sender<Message>>>>,
    departures: broadcast::Sender<NodeId>,
    inbox_capacity: usize,
    send_timeout: Duration,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let (departures, _) = broadcast::channel(config.departure_capacity());
        Self {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            departures,
            inbox_capacity: config.inbox_capacity(),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }

    /// Open the inbox for `endpoint`. A previous subscription for the same
    /// endpoint is replaced and its stream ends.
    pub async fn subscribe(&self, endpoint: Endpoint) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inbox_capacity);
        let previous = self.inboxes.write().await.insert(endpoint, tx);
        if previous.is_some() {
            tracing::debug!(endpoint = %endpoint, "Replaced existing subscription");
        }
        ReceiverStream::new(rx)
    }

    /// Deliver `message` to `target`.
    ///
    /// Fails with [`MeshError::RecipientUnreachable`] when the target never
    /// subscribed, has gone away, or its inbox stayed full for the whole send
    /// timeout. An inbox whose receiver was dropped counts as a crashed node:
    /// it is removed and a departure is published.
    pub async fn send(&self, target: Endpoint, message: Message) -> Result<()> {
        let tx = self
            .inboxes
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or(MeshError::RecipientUnreachable(target))?;

        let kind = message.kind();
        match tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                tracing::warn!(target = %target, kind = %kind, "Send timed out");
                Err(MeshError::RecipientUnreachable(target))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                tracing::warn!(target = %target, kind = %kind, "Recipient inbox closed");
                self.disconnect(target).await;
                Err(MeshError::RecipientUnreachable(target))
            }
        }
    }

    /// Drop the inbox for `endpoint`. Idempotent; a departure is published
    /// only the first time.
    pub async fn disconnect(&self, endpoint: Endpoint) {
        let removed = self.inboxes.write().await.remove(&endpoint).is_some();
        if removed {
            if let Endpoint::Node(node_id) = endpoint {
                tracing::info!(node_id, "Node disconnected from bus");
                // No receivers just means nobody is watching yet.
                let _ = self.departures.send(node_id);
            }
        }
    }

    /// Node departures, in the order they were observed.
    pub fn departures(&self) -> broadcast::Receiver<NodeId> {
        self.departures.subscribe()
    }

    pub async fn is_connected(&self, endpoint: Endpoint) -> bool {
        self.inboxes.read().await.contains_key(&endpoint)
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn push(sender: Endpoint, slot: usize) -> Message {
        Message::new(
            sender,
            Payload::PushResults {
                slot,
                payload: json!(slot),
            },
        )
    }

    #[tokio::test]
    async fn delivers_in_order_per_sender() {
        let bus = MessageBus::default();
        let mut inbox = bus.subscribe(Endpoint::Master).await;

        for slot in 0..5 {
            bus.send(Endpoint::Master, push(Endpoint::Node(1), slot))
                .await
                .unwrap();
        }

        for expected in 0..5 {
            let msg = inbox.next().await.unwrap();
            assert_eq!(msg, push(Endpoint::Node(1), expected));
        }
    }

    #[tokio::test]
    async fn unknown_target_is_unreachable() {
        let bus = MessageBus::default();
        let err = bus
            .send(Endpoint::Node(9), push(Endpoint::Master, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::RecipientUnreachable(Endpoint::Node(9))
        ));
    }

    #[tokio::test]
    async fn full_inbox_times_out() {
        let bus = MessageBus::new(BusConfig {
            inbox_capacity: 1,
            send_timeout_ms: 20,
            ..BusConfig::default()
        });
        let _inbox = bus.subscribe(Endpoint::Node(1)).await;

        bus.send(Endpoint::Node(1), push(Endpoint::Master, 0))
            .await
            .unwrap();
        let err = bus
            .send(Endpoint::Node(1), push(Endpoint::Master, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RecipientUnreachable(_)));
        // A slow node is still connected; only a crash removes it.
        assert!(bus.is_connected(Endpoint::Node(1)).await);
    }

    #[tokio::test]
    async fn zero_inbox_capacity_still_delivers() {
        let bus = MessageBus::new(BusConfig {
            inbox_capacity: 0,
            departure_capacity: 0,
            ..BusConfig::default()
        });
        let mut inbox = bus.subscribe(Endpoint::Node(2)).await;

        bus.send(Endpoint::Node(2), push(Endpoint::Master, 0))
            .await
            .unwrap();
        assert_eq!(inbox.next().await.unwrap(), push(Endpoint::Master, 0));
    }

    #[tokio::test]
    async fn dropped_subscription_publishes_departure() {
        let bus = MessageBus::default();
        let mut departures = bus.departures();
        let inbox = bus.subscribe(Endpoint::Node(3)).await;
        drop(inbox);

        let err = bus
            .send(Endpoint::Node(3), push(Endpoint::Master, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RecipientUnreachable(_)));
        assert_eq!(departures.recv().await.unwrap(), 3);
        assert!(!bus.is_connected(Endpoint::Node(3)).await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let bus = MessageBus::default();
        let mut departures = bus.departures();
        let _inbox = bus.subscribe(Endpoint::Node(5)).await;

        bus.disconnect(Endpoint::Node(5)).await;
        bus.disconnect(Endpoint::Node(5)).await;

        assert_eq!(departures.recv().await.unwrap(), 5);
        assert!(departures.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_replaces_inbox() {
        let bus = MessageBus::default();
        let mut first = bus.subscribe(Endpoint::Node(1)).await;
        let mut second = bus.subscribe(Endpoint::Node(1)).await;

        bus.send(Endpoint::Node(1), push(Endpoint::Master, 0))
            .await
            .unwrap();

        assert!(first.next().await.is_none());
        assert_eq!(second.next().await.unwrap(), push(Endpoint::Master, 0));
    }
}
