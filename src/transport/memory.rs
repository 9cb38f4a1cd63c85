//! In-process broker for tests and local runs.
//!
//! Delivers synchronously at publish time to every matching
//! subscription (including the publisher's own, as a real broker does
//! without the no-local flag), records an ordered event log, counts
//! opened and released connections, and can inject the faults a real
//! broker produces: refused or hanging connects, rejected subscribe or
//! publish, dropped connections, and QoS 1 redelivery.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::checkin::error::HandshakeError;
use crate::checkin::protocol::Envelope;
use crate::checkin::session::{ChannelSession, Connector, InboundMessage};

/// Ordered record of what the broker observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { client_id: String },
    SubscribeAcked { client_id: String, topic: String },
    Published {
        /// `None` for messages injected by the test itself.
        client_id: Option<String>,
        topic: String,
        payload: Vec<u8>,
    },
    Closed { client_id: String },
}

#[derive(Debug, Clone, Default)]
struct Faults {
    unreachable: bool,
    hang_connect: bool,
    reject_subscribe: bool,
    reject_publish: bool,
    subscribe_ack_delay: Option<Duration>,
    /// Copies delivered per publish; 0 is treated as 1.
    deliveries: usize,
}

enum Delivery {
    Message(InboundMessage),
    Disconnected(String),
}

struct Connection {
    client_id: String,
    tx: mpsc::UnboundedSender<Delivery>,
    filters: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    next_conn: u64,
    connections: HashMap<u64, Connection>,
    faults: Faults,
    opened: usize,
    released: usize,
    events: Vec<BrokerEvent>,
}

impl BrokerState {
    fn deliver(&mut self, client_id: Option<&str>, topic: &str, payload: &[u8]) {
        self.events.push(BrokerEvent::Published {
            client_id: client_id.map(str::to_string),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        let copies = self.faults.deliveries.max(1);
        for conn in self.connections.values() {
            if !conn.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            for _ in 0..copies {
                let _ = conn.tx.send(Delivery::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                }));
            }
        }
    }
}

/// Shared handle to one in-process broker. Cloning shares the broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Fault injection ─────────────────────────────────────────

    /// Refuse every new connection.
    pub fn set_unreachable(&self, on: bool) {
        self.state.lock().faults.unreachable = on;
    }

    /// Never answer connects, so only the caller's connect timeout ends them.
    pub fn set_hang_connect(&self, on: bool) {
        self.state.lock().faults.hang_connect = on;
    }

    pub fn set_reject_subscribe(&self, on: bool) {
        self.state.lock().faults.reject_subscribe = on;
    }

    pub fn set_reject_publish(&self, on: bool) {
        self.state.lock().faults.reject_publish = on;
    }

    /// Delay every subscribe acknowledgement.
    pub fn set_subscribe_ack_delay(&self, delay: Option<Duration>) {
        self.state.lock().faults.subscribe_ack_delay = delay;
    }

    /// Deliver every publish `copies` times, as QoS 1 redelivery may.
    pub fn set_duplicate_deliveries(&self, copies: usize) {
        self.state.lock().faults.deliveries = copies;
    }

    /// Reset every live connection. Their sessions see a transport error.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        for (_, conn) in state.connections.drain() {
            tracing::debug!(client_id = %conn.client_id, "dropping in-process connection");
            let _ = conn
                .tx
                .send(Delivery::Disconnected("connection reset by broker".into()));
        }
    }

    /// Publish from outside any session.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.state.lock().deliver(None, topic, &payload);
    }

    // ── Inspection ──────────────────────────────────────────────

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    /// Connections still registered with the broker.
    pub fn live_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    /// Decoded envelopes published on `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                BrokerEvent::Published { topic: t, payload, .. } if t == topic => {
                    Envelope::from_bytes(payload)
                }
                _ => None,
            })
            .collect()
    }

    /// Position of the first event matching `pred` in the log.
    pub fn position_of(&self, pred: impl Fn(&BrokerEvent) -> bool) -> Option<usize> {
        self.state.lock().events.iter().position(pred)
    }

    fn release(&self, conn_id: u64, client_id: &str) {
        let mut state = self.state.lock();
        state.connections.remove(&conn_id);
        state.released += 1;
        state.events.push(BrokerEvent::Closed {
            client_id: client_id.to_string(),
        });
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn open(&self, client_id: &str) -> Result<MemorySession, HandshakeError> {
        let (unreachable, hang) = {
            let state = self.state.lock();
            (state.faults.unreachable, state.faults.hang_connect)
        };
        if unreachable {
            return Err(HandshakeError::Connect("connection refused".into()));
        }
        if hang {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = {
            let mut state = self.state.lock();
            state.next_conn += 1;
            let conn_id = state.next_conn;
            state.connections.insert(
                conn_id,
                Connection {
                    client_id: client_id.to_string(),
                    tx,
                    filters: Vec::new(),
                },
            );
            state.opened += 1;
            state.events.push(BrokerEvent::Connected {
                client_id: client_id.to_string(),
            });
            conn_id
        };

        Ok(MemorySession {
            broker: self.clone(),
            client_id: client_id.to_string(),
            conn_id,
            rx,
            closed: false,
        })
    }
}

/// Client side of one in-process connection.
pub struct MemorySession {
    broker: MemoryBroker,
    client_id: String,
    conn_id: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl MemorySession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl ChannelSession for MemorySession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), HandshakeError> {
        let delay = {
            let mut state = self.broker.state.lock();
            if state.faults.reject_subscribe {
                return Err(HandshakeError::Subscribe("subscription refused".into()));
            }
            let delay = state.faults.subscribe_ack_delay;
            let conn = state
                .connections
                .get_mut(&self.conn_id)
                .ok_or_else(|| HandshakeError::Subscribe("not connected".into()))?;
            conn.filters.push(topic.to_string());
            delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.broker.state.lock().events.push(BrokerEvent::SubscribeAcked {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), HandshakeError> {
        let mut state = self.broker.state.lock();
        if state.faults.reject_publish {
            return Err(HandshakeError::Publish("publish refused".into()));
        }
        if !state.connections.contains_key(&self.conn_id) {
            return Err(HandshakeError::Publish("not connected".into()));
        }
        state.deliver(Some(&self.client_id), topic, &payload);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<InboundMessage, HandshakeError> {
        if self.closed {
            return Err(HandshakeError::TransportFailed("session closed".into()));
        }
        match self.rx.recv().await {
            Some(Delivery::Message(msg)) => Ok(msg),
            Some(Delivery::Disconnected(reason)) => Err(HandshakeError::TransportFailed(reason)),
            None => Err(HandshakeError::TransportFailed("broker gone".into())),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.broker.release(self.conn_id, &self.client_id);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.broker.release(self.conn_id, &self.client_id);
        }
    }
}

/// MQTT topic filter matching with `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
