//! Handshake state machine.
//!
//! One authoritative [`HandshakeMachine::apply`] decides every
//! transition. Terminal states absorb all further events, which is what
//! makes "already resolved, ignore the rest" hold by construction.

use super::error::HandshakeError;
use super::protocol::Verification;

/// Which protocol shape a machine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Publish once, success on broker ack.
    FireAndForget,
    /// Subscribe, publish the challenge, wait for the verification.
    PublishThenAwait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    Subscribing,
    Publishing,
    Awaiting,
    /// Fire-and-forget publish acknowledged.
    Published,
    /// Matching verification received.
    Resolved(Verification),
    TimedOut,
    Cancelled,
    Failed(HandshakeError),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Published | Self::Resolved(_) | Self::TimedOut | Self::Cancelled | Self::Failed(_)
        )
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Publishing => "publishing",
            Self::Awaiting => "awaiting",
            Self::Published => "published",
            Self::Resolved(_) => "resolved",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Connected,
    SubscribeAcked,
    PublishAcked,
    Matched(Verification),
    DeadlineElapsed,
    Cancelled,
    TransportError(HandshakeError),
}

#[derive(Debug)]
pub struct HandshakeMachine {
    shape: Shape,
    state: HandshakeState,
}

impl HandshakeMachine {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            state: HandshakeState::Connecting,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one event and return the resulting state.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    /// The deadline only governs the phases after `Connecting`, which has
    /// its own connect timeout reported as a transport error.
    pub fn apply(&mut self, event: HandshakeEvent) -> &HandshakeState {
        use HandshakeEvent as E;
        use HandshakeState as S;

        if self.state.is_terminal() {
            return &self.state;
        }

        let next = match (&self.state, event) {
            (_, E::Cancelled) => Some(S::Cancelled),
            (_, E::TransportError(err)) => Some(S::Failed(err)),

            (S::Connecting, E::Connected) => Some(match self.shape {
                Shape::FireAndForget => S::Publishing,
                Shape::PublishThenAwait => S::Subscribing,
            }),
            (S::Subscribing, E::SubscribeAcked) => Some(S::Publishing),
            (S::Publishing, E::PublishAcked) => Some(match self.shape {
                Shape::FireAndForget => S::Published,
                Shape::PublishThenAwait => S::Awaiting,
            }),
            (S::Awaiting, E::Matched(verification)) => Some(S::Resolved(verification)),

            (S::Subscribing | S::Publishing | S::Awaiting, E::DeadlineElapsed) => Some(S::TimedOut),

            _ => None,
        };

        if let Some(next) = next {
            tracing::trace!(from = self.state.label(), to = next.label(), "handshake transition");
            self.state = next;
        }
        &self.state
    }
}
