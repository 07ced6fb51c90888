//! Relay loops: the tasks that couple a `BrokerAdapter` to a protocol
//! engine through the `MessageTranslator`, per `spec.md` §4.6.
//!
//! Grounded on the teacher crate's `communication::Node` task-pair
//! pattern (a consumer task and an acknowledging task talking only
//! through channels, never sharing a lock).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, BrokerMessage};
use crate::directory::{NodeInfo, PeerInfo};
use crate::protocol::client::ClientConnection;
use crate::protocol::server::ServerConnection;
use crate::protocol::WriteItem;
use crate::queue::Watermark;
use crate::translate::{self, Message, TranslatorConfig};

/// Drives the client-role (outbound) side of a connection: consumes
/// broker deliveries, transforms and forwards them, and acks the
/// original delivery once the peer confirms receipt.
pub struct ClientSide {
    owner: Arc<NodeInfo>,
    peer: Arc<PeerInfo>,
    broker: Arc<dyn BrokerAdapter>,
    conn: ClientConnection,
}

impl ClientSide {
    pub fn new(owner: Arc<NodeInfo>, peer: Arc<PeerInfo>, broker: Arc<dyn BrokerAdapter>, conn: ClientConnection) -> Self {
        ClientSide { owner, peer, broker, conn }
    }

    /// Run until the broker subscription ends or the connection fails.
    /// In-flight deliveries are tracked by message id so that an
    /// incoming `RECEIPT` can be matched back to the exact delivery
    /// tag to ack. The map is capped at `MAX_IN_FLIGHT`: once it's
    /// full, the broker subscription is not polled again until the
    /// ack task frees a slot, per `spec.md` §4.6's back-pressure
    /// requirement.
    pub async fn run(self) -> crate::error::Result<()> {
        let mut deliveries = self.broker.subscribe().await?;
        let in_flight: Arc<tokio::sync::Mutex<HashMap<String, u64>>> = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let slot_freed = Arc::new(Notify::new());
        let ack_task_done = Arc::new(AtomicBool::new(false));

        let ack_task = {
            let broker = self.broker.clone();
            let recv_queue = self.conn.recv_queue.clone();
            let in_flight = in_flight.clone();
            let pause_gate = self.conn.pause_gate.clone();
            let slot_freed = slot_freed.clone();
            let ack_task_done = ack_task_done.clone();
            tokio::spawn(async move {
                while let Some(receipt_id) = recv_queue.get().await {
                    if let Some(crate::queue::Watermark::Low) = recv_queue.task_done() {
                        pause_gate.resume();
                    }
                    let tag = in_flight.lock().await.remove(&receipt_id);
                    // `notify_one` stores a permit when nobody's waiting
                    // yet, so this can't race ahead of the capacity
                    // check below the way `notify_waiters` could.
                    slot_freed.notify_one();
                    match tag {
                        Some(tag) => {
                            if let Err(e) = broker.ack(tag).await {
                                warn!(error = %e, "failed to ack broker delivery");
                            }
                        }
                        None => warn!(receipt_id, "receipt for unknown delivery"),
                    }
                }
                ack_task_done.store(true, Ordering::SeqCst);
                slot_freed.notify_waiters();
            })
        };

        loop {
            while in_flight.lock().await.len() >= MAX_IN_FLIGHT {
                if ack_task_done.load(Ordering::SeqCst) {
                    break;
                }
                slot_freed.notified().await;
            }

            let Some(delivery) = deliveries.recv().await else {
                break;
            };
            let message_type = delivery.message_type.clone().unwrap_or_default();
            let id = uuid::Uuid::new_v4().to_string();

            match translate::transform_message(&self.owner, &self.peer, &message_type, &id, &delivery.content_type, &delivery.body)
            {
                Ok(message) => {
                    if let Some(tag) = delivery.delivery_tag {
                        in_flight.lock().await.insert(id.clone(), tag);
                    }
                    self.conn.send_queue.put(WriteItem::Item(message)).await;
                }
                Err(e) => {
                    warn!(error = %e, message_type, "dropping undeliverable broker message");
                    if let Some(tag) = delivery.delivery_tag {
                        let _ = self.broker.nack(tag, false).await;
                    }
                }
            }
        }

        self.conn.send_queue.put(WriteItem::Close).await;
        ack_task.await.expect("ack task panicked");
        Ok(())
    }
}

/// Upper bound on unacked broker deliveries a `ClientSide` will hold at
/// once; matches the send-queue capacity set in `bin/relay.rs` so the
/// two back-pressure mechanisms bite at the same scale.
const MAX_IN_FLIGHT: usize = 64;

/// Drives the server-role (inbound) side of a connection: consumes
/// frames the peer sent, preprocesses them, publishes to the broker,
/// and pushes a receipt (or error) back onto the send-queue.
pub struct ServerSide {
    owner: Arc<NodeInfo>,
    peer: Arc<PeerInfo>,
    config: TranslatorConfig,
    broker: Arc<dyn BrokerAdapter>,
    conn: ServerConnection,
}

impl ServerSide {
    pub fn new(
        owner: Arc<NodeInfo>,
        peer: Arc<PeerInfo>,
        config: TranslatorConfig,
        broker: Arc<dyn BrokerAdapter>,
        conn: ServerConnection,
    ) -> Self {
        ServerSide { owner, peer, config, broker, conn }
    }

    pub async fn run(self) -> crate::error::Result<()> {
        loop {
            let Some(message) = self.conn.recv_queue.get().await else {
                break;
            };
            if let Some(Watermark::Low) = self.conn.recv_queue.task_done() {
                self.conn.pause_gate.resume();
            }
            self.handle(message).await;
        }
        self.conn.send_queue.put(WriteItem::Close).await;
        Ok(())
    }

    async fn handle(&self, message: Message) {
        let receipt_id = message.id.clone();
        match translate::preprocess_message(&self.owner, &self.peer, &self.config, &message) {
            Ok(broker_message) => {
                if let Err(e) = self.publish(broker_message).await {
                    self.conn.send_queue.put(WriteItem::Error(e)).await;
                    return;
                }
                info!(receipt_id, "message relayed to broker");
                self.conn.send_queue.put(WriteItem::Item(receipt_id)).await;
            }
            Err(e) => {
                warn!(error = %e.message, receipt_id, "rejecting inbound message");
                self.conn.send_queue.put(WriteItem::Error(e)).await;
            }
        }
    }

    async fn publish(&self, message: BrokerMessage) -> crate::error::Result<(), crate::error::ServerError> {
        self.broker
            .publish(message)
            .await
            .map_err(|_| crate::error::ServerError::simple("failed to publish to broker"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::directory::NodeRole;
    use crate::protocol::client::{self, ClientConfig};
    use crate::protocol::server::{self, ServerConfig};
    use crate::subnet::Subnet;
    use serde_json::json;

    fn aa_node() -> Arc<NodeInfo> {
        Arc::new(NodeInfo {
            role: NodeRole::Aa,
            node_id: "aa1".to_owned(),
            root_cert: Vec::new(),
            creditors_subnet: Some(Subnet::parse("00").unwrap()),
            debtors_subnet: Some(Subnet::parse("00").unwrap()),
        })
    }

    fn ca_peer() -> Arc<PeerInfo> {
        Arc::new(PeerInfo {
            role: NodeRole::Ca,
            node_id: "ca1".to_owned(),
            servers: Vec::new(),
            stomp_host: None,
            stomp_destination: None,
            root_cert: Vec::new(),
            peer_cert: Vec::new(),
            sub_cert: None,
            creditors_subnet: Subnet::parse("00").unwrap(),
            debtors_subnet: Subnet::parse("00").unwrap(),
        })
    }

    #[tokio::test]
    async fn client_side_transforms_and_forwards_broker_delivery() {
        let body = serde_json::to_vec(&json!({
            "type": "AccountPurge",
            "debtor_id": 1,
            "creditor_id": 2,
            "creation_date": "2001-01-01",
            "ts": "2023-01-01T12:00:00+00:00"
        }))
        .unwrap();
        let mut delivery = BrokerMessage::outbound("x", "application/json", body);
        delivery.message_type = Some("AccountPurge".to_owned());
        delivery.delivery_tag = Some(42);

        let broker: Arc<dyn BrokerAdapter> = Arc::new(MemoryBroker::new(vec![delivery]));

        let (client_io, mut peer_io) = tokio::io::duplex(8192);
        let peer_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 4096];
            let n = peer_io.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT\n"));
            let connected = crate::frame::Frame::new(
                crate::frame::Command::Connected,
                vec![("version".to_owned(), "1.2".to_owned()), ("heart-beat".to_owned(), "0,0".to_owned())],
                Vec::new(),
            );
            peer_io.write_all(&connected.encode()).await.unwrap();

            let n = peer_io.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"SEND\n"));
            // Dropping peer_io here closes the transport, which is what
            // unblocks the client engine's reader and lets `run` finish.
        });

        let conn = client::connect(
            client_io,
            ClientConfig {
                host: "aa1".to_owned(),
                send_destination: "/exchange/in".to_owned(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let side = ClientSide::new(aa_node(), ca_peer(), broker, conn);
        let (run_result, peer_result) = tokio::join!(side.run(), peer_task);
        run_result.unwrap();
        peer_result.unwrap();
    }

    #[tokio::test]
    async fn server_side_publishes_and_emits_receipt() {
        let broker = Arc::new(MemoryBroker::new(Vec::new()));
        let broker_dyn: Arc<dyn BrokerAdapter> = broker.clone();

        let (peer_io, server_io) = tokio::io::duplex(8192);
        let mut peer_io = peer_io;
        let client_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let connect = crate::frame::Frame::new(
                crate::frame::Command::Connect,
                vec![
                    ("accept-version".to_owned(), "1.2".to_owned()),
                    ("host".to_owned(), "relay".to_owned()),
                    ("heart-beat".to_owned(), "0,0".to_owned()),
                ],
                Vec::new(),
            );
            peer_io.write_all(&connect.encode()).await.unwrap();
            let mut buf = [0u8; 4096];
            let n = peer_io.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECTED\n"));

            let body = serde_json::to_vec(&json!({
                "type": "AccountPurge",
                "debtor_id": 1,
                "creditor_id": 2,
                "creation_date": "2001-01-01",
                "ts": "2023-01-01T12:00:00+00:00"
            }))
            .unwrap();
            let send = crate::frame::Frame::new(
                crate::frame::Command::Send,
                vec![
                    ("destination".to_owned(), "/exchange/out".to_owned()),
                    ("content-type".to_owned(), "application/json".to_owned()),
                    ("message-type".to_owned(), "AccountPurge".to_owned()),
                    ("receipt".to_owned(), "r1".to_owned()),
                ],
                body,
            );
            peer_io.write_all(&send.encode()).await.unwrap();

            let n = peer_io.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"RECEIPT\nreceipt-id:r1\n"));
            peer_io
        });

        let conn = server::accept(server_io, ServerConfig::default()).await.unwrap();
        let owner = Arc::new(NodeInfo {
            role: NodeRole::Da,
            node_id: "da1".to_owned(),
            root_cert: Vec::new(),
            creditors_subnet: None,
            debtors_subnet: Some(Subnet::ANY),
        });
        let peer = Arc::new(PeerInfo {
            role: NodeRole::Aa,
            node_id: "aa1".to_owned(),
            servers: Vec::new(),
            stomp_host: None,
            stomp_destination: None,
            root_cert: Vec::new(),
            peer_cert: Vec::new(),
            sub_cert: None,
            creditors_subnet: Subnet::ANY,
            debtors_subnet: Subnet::ANY,
        });

        let side = ServerSide::new(owner, peer, TranslatorConfig::default(), broker_dyn, conn);
        let receiver = tokio::spawn(side.run());

        client_task.await.unwrap();
        drop(receiver);

        assert_eq!(broker.published().len(), 1);
    }
}
