//! The internal broker side of the relay: an `async_trait` adapter the
//! relay loops drive, plus an in-memory double used by tests.
//!
//! Grounded on the teacher crate's `communication::Node` bootstrap/
//! channel split (one task owns the channel, others talk to it through
//! message-passing rather than a shared lock) and on `spec.md` §3's
//! broker message envelope / §4.6 relay loop description.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message as exchanged with the internal broker: either inbound from
/// a subscribed queue, or outbound to be published.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub routing_key: String,
    pub content_type: String,
    pub message_type: Option<String>,
    pub body: Vec<u8>,
    /// Headers derived by the `translate` module: `message-type`,
    /// `debtor-id`, `creditor-id`, and, when present, `coordinator-id`/
    /// `coordinator-type`/`ca-creditors`/`ca-trade`.
    pub headers: BTreeMap<String, serde_json::Value>,
    /// Opaque delivery tag, used to ack/nack the exact delivery it came
    /// with; absent on messages not yet delivered (outbound).
    pub delivery_tag: Option<u64>,
}

impl BrokerMessage {
    pub fn outbound(routing_key: impl Into<String>, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        BrokerMessage {
            routing_key: routing_key.into(),
            content_type: content_type.into(),
            message_type: None,
            body,
            headers: BTreeMap::new(),
            delivery_tag: None,
        }
    }
}

/// The relay's view of the internal broker: a queue to consume from and
/// an exchange to publish to, with explicit ack/nack of consumed
/// deliveries.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Begin consuming from the queue bound to this connection. Returns
    /// a channel the relay loop reads deliveries from.
    async fn subscribe(&self) -> crate::error::Result<mpsc::Receiver<BrokerMessage>>;

    /// Acknowledge successful processing of a delivery.
    async fn ack(&self, delivery_tag: u64) -> crate::error::Result<()>;

    /// Reject a delivery; `requeue` controls whether the broker should
    /// redeliver it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> crate::error::Result<()>;

    /// Publish a message to the configured exchange.
    async fn publish(&self, message: BrokerMessage) -> crate::error::Result<()>;
}

/// An in-process `BrokerAdapter` for tests: `publish` appends to a
/// shared log, `subscribe` drains a preloaded queue.
pub struct MemoryBroker {
    inbound: tokio::sync::Mutex<Option<mpsc::Receiver<BrokerMessage>>>,
    published: std::sync::Mutex<Vec<BrokerMessage>>,
    acked: std::sync::Mutex<Vec<u64>>,
    nacked: std::sync::Mutex<Vec<(u64, bool)>>,
}

impl MemoryBroker {
    /// Build a broker double whose `subscribe` yields exactly
    /// `preloaded`, in order, then ends.
    pub fn new(preloaded: Vec<BrokerMessage>) -> Self {
        let (tx, rx) = mpsc::channel(preloaded.len().max(1));
        for msg in preloaded {
            let _ = tx.try_send(msg);
        }
        MemoryBroker {
            inbound: tokio::sync::Mutex::new(Some(rx)),
            published: std::sync::Mutex::new(Vec::new()),
            acked: std::sync::Mutex::new(Vec::new()),
            nacked: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.nacked.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerAdapter for MemoryBroker {
    async fn subscribe(&self) -> crate::error::Result<mpsc::Receiver<BrokerMessage>> {
        self.inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| crate::error::ServerError::simple("subscribe called twice").into())
    }

    async fn ack(&self, delivery_tag: u64) -> crate::error::Result<()> {
        self.acked.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> crate::error::Result<()> {
        self.nacked.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(&self, message: BrokerMessage) -> crate::error::Result<()> {
        self.published.lock().unwrap().push(message);
        Ok(())
    }
}
