//! Typed failures of a handshake operation.

/// Everything a handshake call can fail with.
///
/// A refused nonce is not an error: it comes back as
/// [`Verification`](super::protocol::Verification) with `accepted == false`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Broker unreachable, refused the connection, or the connect timeout elapsed.
    #[error("broker connect failed: {0}")]
    Connect(String),

    /// Broker rejected or never acknowledged the subscription.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Broker rejected or never acknowledged the publish.
    #[error("publish failed: {0}")]
    Publish(String),

    /// No matching response before the deadline.
    #[error("no verification received within {0:?}")]
    TimedOut(std::time::Duration),

    /// Connection dropped while waiting for a response.
    #[error("transport failed while awaiting response: {0}")]
    TransportFailed(String),

    /// The caller's cancellation token fired.
    #[error("handshake cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl HandshakeError {
    /// Nobody answered in time. Worth prompting a retry with a fresh nonce.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Infrastructure fault rather than a protocol outcome.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Subscribe(_) | Self::Publish(_) | Self::TransportFailed(_)
        )
    }
}
