//! Correlation waiter.
//!
//! Watches a subscribed session until the verification for one nonce
//! arrives, the deadline passes, the caller cancels, or the connection
//! drops. Everything else on the topic is ignored: a device topic is
//! shared by every concurrent operation against that device.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{Envelope, Nonce, Verification};
use super::session::{ChannelSession, Subscribed};

/// Terminal result of waiting for one nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted { details: Envelope },
    Rejected { error: Option<String> },
    TimedOut,
    TransportFailed { cause: String },
    Cancelled,
}

impl Outcome {
    fn from_match(envelope: Envelope) -> Self {
        if envelope.accepted == Some(true) {
            Self::Accepted { details: envelope }
        } else {
            Self::Rejected {
                error: envelope.error,
            }
        }
    }

    /// The verification carried by a matched response, if any.
    pub fn verification(&self) -> Option<Verification> {
        match self {
            Self::Accepted { details } => Some(Verification::from_envelope(details)),
            Self::Rejected { error } => Some(Verification {
                accepted: false,
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// In-flight expectation for one nonce with a single-resolution slot.
#[derive(Debug)]
pub struct PendingOperation {
    expected: Nonce,
    deadline: Instant,
    slot: Option<Outcome>,
}

impl PendingOperation {
    pub fn new(expected: Nonce, deadline: Instant) -> Self {
        Self {
            expected,
            deadline,
            slot: None,
        }
    }

    pub fn expected(&self) -> &Nonce {
        &self.expected
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_some()
    }

    /// Offer an inbound envelope. Returns true only for the first
    /// matching verification; it becomes the outcome.
    pub fn offer(&mut self, envelope: &Envelope) -> bool {
        if self.slot.is_some() || !envelope.is_verification_of(&self.expected) {
            return false;
        }
        self.slot = Some(Outcome::from_match(envelope.clone()));
        true
    }

    /// Resolve with a non-message outcome. No-op once resolved.
    pub fn resolve(&mut self, outcome: Outcome) -> bool {
        if self.slot.is_some() {
            return false;
        }
        self.slot = Some(outcome);
        true
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.slot.as_ref()
    }

    pub fn into_outcome(self) -> Option<Outcome> {
        self.slot
    }
}

/// Drives a [`PendingOperation`] from a subscribed session.
pub struct CorrelationWaiter {
    pending: PendingOperation,
    ignored: usize,
}

impl CorrelationWaiter {
    pub fn new(expected: Nonce, deadline: Instant) -> Self {
        Self {
            pending: PendingOperation::new(expected, deadline),
            ignored: 0,
        }
    }

    /// Messages seen and discarded so far.
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    /// Wait for the match. The deadline and the cancellation token are
    /// checked ahead of inbound traffic, so once either has fired a late
    /// response is never taken.
    pub async fn await_match<S: ChannelSession>(
        mut self,
        subscribed: &mut Subscribed<'_, S>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let deadline = self.pending.deadline();
        let topic = subscribed.topic().to_string();

        while !self.pending.is_resolved() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.pending.resolve(Outcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.pending.resolve(Outcome::TimedOut);
                }
                inbound = subscribed.next_message() => match inbound {
                    Ok(msg) if msg.topic != topic => {
                        self.ignored += 1;
                        tracing::trace!(topic = %msg.topic, "ignoring message on foreign topic");
                    }
                    Ok(msg) => match Envelope::from_bytes(&msg.payload) {
                        Some(envelope) => {
                            if !self.pending.offer(&envelope) {
                                self.ignored += 1;
                                tracing::trace!(
                                    stage = ?envelope.stage,
                                    nonce = ?envelope.nonce,
                                    "ignoring non-matching envelope"
                                );
                            }
                        }
                        None => {
                            self.ignored += 1;
                            tracing::debug!(topic = %topic, bytes = msg.payload.len(), "ignoring undecodable payload");
                        }
                    },
                    Err(e) => {
                        self.pending.resolve(Outcome::TransportFailed { cause: e.to_string() });
                    }
                }
            }
        }

        tracing::debug!(
            nonce = %self.pending.expected(),
            ignored = self.ignored,
            "correlation wait finished"
        );
        self.pending.into_outcome().unwrap_or(Outcome::TimedOut)
    }
}
