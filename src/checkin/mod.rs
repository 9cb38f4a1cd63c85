//! Device check-in authentication handshake.
//!
//! A mobile client and an edge device authenticate each other over a
//! shared pub/sub topic, `devices/{hid}/auth`. One side publishes a
//! challenge carrying a nonce and waits for the `nonce_verify` reply that
//! carries the same nonce; the other side answers each challenge once.
//!
//! - [`session`] wraps one broker connection per operation.
//! - [`waiter`] correlates inbound replies against the expected nonce.
//! - [`coordinator`] sequences both into the two handshake shapes.
//! - [`responder`] is the answering side.

pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod responder;
pub mod session;
pub mod state;
pub mod waiter;

pub use coordinator::{Challenge, HandshakeCoordinator};
pub use error::HandshakeError;
pub use protocol::{CheckinPayload, DeviceId, Envelope, Nonce, Stage, Verification};
pub use responder::{
    AcceptAll, ExpiringNonceVerifier, NonceResponder, NonceVerifier, RejectAll, ResponderStats,
    SeenNonces,
};
pub use session::{
    ChannelSession, Connector, InboundMessage, OperationIds, RandomOperationIds,
    SequentialOperationIds, Subscribed,
};
pub use state::{HandshakeEvent, HandshakeMachine, HandshakeState, Shape};
pub use waiter::{CorrelationWaiter, Outcome, PendingOperation};
