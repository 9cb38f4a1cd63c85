//! Broker session seam.
//!
//! A [`ChannelSession`] is one exclusively owned broker connection that
//! lives for exactly one handshake operation. [`Connector`] opens them.
//! The MQTT implementation lives in `transport::mqtt`; an in-process
//! broker for tests lives in `transport::memory`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::HandshakeError;

/// A publish received on one of the session's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// One connected, exclusively owned broker connection.
///
/// All traffic uses QoS 1, so receivers must tolerate duplicates.
#[async_trait]
pub trait ChannelSession: Send {
    /// Subscribe and wait for the broker's acknowledgement.
    async fn subscribe(&mut self, topic: &str) -> Result<(), HandshakeError>;

    /// Publish and wait for the broker's acknowledgement. Messages that
    /// arrive on subscriptions while waiting are kept for
    /// [`next_message`](Self::next_message).
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), HandshakeError>;

    /// Next inbound message. Fails once the connection is gone.
    /// Must be cancel safe: it is raced against deadlines.
    async fn next_message(&mut self) -> Result<InboundMessage, HandshakeError>;

    /// Release the connection. Idempotent and valid in any state.
    async fn close(&mut self);
}

/// Opens sessions against one broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: ChannelSession + 'static;

    /// Connect and wait for the broker's connection acknowledgement.
    /// The caller bounds this with its connect timeout.
    async fn open(&self, client_id: &str) -> Result<Self::Session, HandshakeError>;
}

// ── Subscribe-before-publish guard ──────────────────────────────

/// A session whose subscription to `topic` has been acknowledged.
///
/// The only way to obtain one is [`Subscribed::acquire`], so code that
/// publishes a challenge and then waits for its answer cannot publish
/// before the broker has confirmed the subscription.
pub struct Subscribed<'s, S: ChannelSession> {
    session: &'s mut S,
    topic: String,
}

impl<'s, S: ChannelSession> Subscribed<'s, S> {
    pub async fn acquire(session: &'s mut S, topic: &str) -> Result<Self, HandshakeError> {
        session.subscribe(topic).await?;
        Ok(Self {
            session,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish on the subscribed topic.
    pub async fn publish(&mut self, payload: Vec<u8>) -> Result<(), HandshakeError> {
        self.session.publish(&self.topic, payload).await
    }

    pub async fn next_message(&mut self) -> Result<InboundMessage, HandshakeError> {
        self.session.next_message().await
    }
}

// ── Client identity ─────────────────────────────────────────────

/// Source of per-operation identifiers. Client ids are derived from
/// these, so a fixed source makes broker-side identities deterministic.
pub trait OperationIds: Send + Sync {
    fn next_operation_id(&self) -> String;
}

/// Random 12-hex-digit operation ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOperationIds;

impl OperationIds for RandomOperationIds {
    fn next_operation_id(&self) -> String {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(12);
        id
    }
}

/// Monotonic ids `op-1`, `op-2`, ...
#[derive(Debug, Default)]
pub struct SequentialOperationIds {
    next: AtomicU64,
}

impl OperationIds for SequentialOperationIds {
    fn next_operation_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("op-{n}")
    }
}

/// Broker client id for an operation: `{prefix}-{operation_id}`.
pub fn client_id(prefix: &str, operation_id: &str) -> String {
    format!("{prefix}-{operation_id}")
}
