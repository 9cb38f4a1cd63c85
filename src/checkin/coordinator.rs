//! Handshake coordinator, the public entry point.
//!
//! Sequences a [`ChannelSession`] and a [`CorrelationWaiter`] into the
//! two shapes the check-in flow needs:
//!
//! - **Fire-and-forget**: connect → publish → close. Succeeds once the
//!   broker acknowledges the publish.
//! - **Publish-then-await**: connect → subscribe (acked) → publish the
//!   challenge → wait for the matching `nonce_verify` → close.
//!
//! Every call opens its own session and closes it on every exit path.
//! The connect phase is bounded by `connect_timeout`; the caller's
//! deadline starts when subscribing begins.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::HandshakeError;
use super::protocol::{CheckinPayload, DeviceId, Envelope, Nonce, Verification};
use super::session::{
    client_id, ChannelSession, Connector, OperationIds, RandomOperationIds, Subscribed,
};
use super::state::{HandshakeEvent, HandshakeMachine, HandshakeState, Shape};
use super::waiter::{CorrelationWaiter, Outcome};
use crate::config::{ChallengeKind, HandshakeConfig};

/// Opening message of a publish-then-await exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// `{stage: nonce_submit, nonce}`.
    NonceSubmit(Nonce),
    /// A plain check-in result; its `nonce` is the correlation key.
    CheckinResult(CheckinPayload),
}

impl Challenge {
    /// Build the configured challenge kind around `nonce`.
    pub fn for_kind(kind: ChallengeKind, nonce: Nonce, payload: CheckinPayload) -> Self {
        match kind {
            ChallengeKind::NonceSubmit => Self::NonceSubmit(nonce),
            ChallengeKind::CheckinResult => Self::CheckinResult(CheckinPayload {
                nonce: Some(nonce),
                ..payload
            }),
        }
    }

    pub fn nonce(&self) -> Option<&Nonce> {
        match self {
            Self::NonceSubmit(nonce) => Some(nonce),
            Self::CheckinResult(payload) => payload.nonce.as_ref(),
        }
    }

    fn envelope(&self) -> Envelope {
        match self {
            Self::NonceSubmit(nonce) => Envelope::nonce_submit(nonce),
            Self::CheckinResult(payload) => Envelope::checkin(payload),
        }
    }
}

/// Runs handshakes against one broker.
///
/// Holds no per-handshake state: concurrent calls share nothing but the
/// connector and settings, so a slow or failing call cannot affect another.
pub struct HandshakeCoordinator<C: Connector> {
    connector: C,
    settings: HandshakeConfig,
    ids: Arc<dyn OperationIds>,
}

impl<C: Connector> HandshakeCoordinator<C> {
    pub fn new(connector: C, settings: HandshakeConfig) -> Self {
        Self {
            connector,
            settings,
            ids: Arc::new(RandomOperationIds),
        }
    }

    /// Replace the operation id source (deterministic client ids in tests).
    pub fn with_operation_ids(mut self, ids: Arc<dyn OperationIds>) -> Self {
        self.ids = ids;
        self
    }

    pub fn settings(&self) -> &HandshakeConfig {
        &self.settings
    }

    // ── Fire-and-forget ─────────────────────────────────────────

    /// Publish a check-in result. No confirmation from the other party
    /// is expected; success means the broker acknowledged the publish.
    pub async fn publish_checkin(
        &self,
        hid: &DeviceId,
        payload: &CheckinPayload,
    ) -> Result<(), HandshakeError> {
        let envelope = Envelope::checkin(payload);
        self.publish_envelope(hid, &envelope, &self.settings.checkin_client_prefix)
            .await
    }

    /// Fire-and-forget publish of any envelope on the device's topic.
    pub async fn publish_envelope(
        &self,
        hid: &DeviceId,
        envelope: &Envelope,
        client_prefix: &str,
    ) -> Result<(), HandshakeError> {
        let payload = envelope.to_bytes()?;
        let topic = hid.auth_topic();
        let client_id = client_id(client_prefix, &self.ids.next_operation_id());
        let mut machine = HandshakeMachine::new(Shape::FireAndForget);

        let mut session = self.connect(&client_id, &mut machine).await?;

        let ack_timeout = self.settings.ack_timeout();
        let result = tokio::time::timeout(ack_timeout, session.publish(&topic, payload)).await;
        match result {
            Ok(Ok(())) => {
                machine.apply(HandshakeEvent::PublishAcked);
            }
            Ok(Err(e)) => {
                machine.apply(HandshakeEvent::TransportError(e));
            }
            Err(_) => {
                machine.apply(HandshakeEvent::TransportError(HandshakeError::Publish(format!(
                    "not acknowledged within {ack_timeout:?}"
                ))));
            }
        }
        session.close().await;

        match machine.state() {
            HandshakeState::Published => {
                tracing::info!(hid = %hid, client_id = %client_id, "check-in result published");
                Ok(())
            }
            HandshakeState::Failed(e) => {
                tracing::warn!(hid = %hid, client_id = %client_id, "check-in publish failed: {e}");
                Err(e.clone())
            }
            other => Err(HandshakeError::Publish(format!(
                "publish ended in unexpected state '{}'",
                other.label()
            ))),
        }
    }

    // ── Publish-then-await ──────────────────────────────────────

    /// Submit `nonce` and wait for the device's verification.
    pub async fn submit_nonce_and_wait(
        &self,
        hid: &DeviceId,
        nonce: Nonce,
        timeout: Duration,
    ) -> Result<Verification, HandshakeError> {
        self.publish_and_await_nonce_verification(
            hid,
            Challenge::NonceSubmit(nonce),
            timeout,
            &CancellationToken::new(),
        )
        .await
    }

    /// Publish `challenge` and wait up to `timeout` (counted from the
    /// start of subscribing) for the `nonce_verify` carrying its nonce.
    ///
    /// A refusal is `Ok` with `accepted == false`. Cancelling `cancel`
    /// has the same effect as the deadline passing, reported as
    /// [`HandshakeError::Cancelled`].
    pub async fn publish_and_await_nonce_verification(
        &self,
        hid: &DeviceId,
        challenge: Challenge,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Verification, HandshakeError> {
        let nonce = challenge.nonce().cloned().ok_or_else(|| {
            HandshakeError::InvalidInput("challenge carries no nonce to correlate on".into())
        })?;
        let payload = challenge.envelope().to_bytes()?;
        let topic = hid.auth_topic();
        let client_id = client_id(
            &self.settings.nonce_client_prefix,
            &self.ids.next_operation_id(),
        );
        let mut machine = HandshakeMachine::new(Shape::PublishThenAwait);

        tracing::debug!(hid = %hid, nonce = %nonce, client_id = %client_id, "starting verification handshake");

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HandshakeError::Cancelled),
            session = self.connect(&client_id, &mut machine) => session?,
        };

        let deadline = Instant::now() + timeout;
        let outcome = exchange(
            &mut session,
            &topic,
            payload,
            nonce,
            deadline,
            cancel,
            &mut machine,
        )
        .await;
        session.close().await;

        if let Some(outcome) = outcome {
            machine.apply(outcome_event(outcome));
        }

        match machine.state() {
            HandshakeState::Resolved(verification) => {
                tracing::info!(
                    hid = %hid,
                    client_id = %client_id,
                    accepted = verification.accepted,
                    "nonce verification received"
                );
                Ok(verification.clone())
            }
            HandshakeState::TimedOut => {
                tracing::warn!(hid = %hid, client_id = %client_id, ?timeout, "nonce verification timed out");
                Err(HandshakeError::TimedOut(timeout))
            }
            HandshakeState::Cancelled => Err(HandshakeError::Cancelled),
            HandshakeState::Failed(e) => {
                tracing::warn!(hid = %hid, client_id = %client_id, "nonce handshake failed: {e}");
                Err(e.clone())
            }
            other => Err(HandshakeError::TransportFailed(format!(
                "handshake ended in non-terminal state '{}'",
                other.label()
            ))),
        }
    }

    /// Open a session within the connect timeout and record the result.
    async fn connect(
        &self,
        client_id: &str,
        machine: &mut HandshakeMachine,
    ) -> Result<C::Session, HandshakeError> {
        let connect_timeout = self.settings.connect_timeout();
        let result = match tokio::time::timeout(connect_timeout, self.connector.open(client_id)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Connect(format!(
                "no broker acknowledgement within {connect_timeout:?}"
            ))),
        };
        match result {
            Ok(session) => {
                machine.apply(HandshakeEvent::Connected);
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(client_id, "broker connect failed: {e}");
                machine.apply(HandshakeEvent::TransportError(e.clone()));
                Err(e)
            }
        }
    }
}

/// Subscribe, publish and wait, all bounded by `deadline` and `cancel`.
///
/// Setup failures are applied to `machine` directly and yield `None`;
/// otherwise the waiter's outcome is returned for the caller to apply.
async fn exchange<S: ChannelSession>(
    session: &mut S,
    topic: &str,
    payload: Vec<u8>,
    nonce: Nonce,
    deadline: Instant,
    cancel: &CancellationToken,
    machine: &mut HandshakeMachine,
) -> Option<Outcome> {
    let mut subscribed = match bounded(deadline, cancel, Subscribed::acquire(session, topic)).await {
        Bounded::Done(Ok(subscribed)) => subscribed,
        Bounded::Done(Err(e)) => {
            machine.apply(HandshakeEvent::TransportError(e));
            return None;
        }
        Bounded::Elapsed => {
            machine.apply(HandshakeEvent::DeadlineElapsed);
            return None;
        }
        Bounded::Cancelled => {
            machine.apply(HandshakeEvent::Cancelled);
            return None;
        }
    };
    machine.apply(HandshakeEvent::SubscribeAcked);

    match bounded(deadline, cancel, subscribed.publish(payload)).await {
        Bounded::Done(Ok(())) => {
            machine.apply(HandshakeEvent::PublishAcked);
        }
        Bounded::Done(Err(e)) => {
            machine.apply(HandshakeEvent::TransportError(e));
            return None;
        }
        Bounded::Elapsed => {
            machine.apply(HandshakeEvent::DeadlineElapsed);
            return None;
        }
        Bounded::Cancelled => {
            machine.apply(HandshakeEvent::Cancelled);
            return None;
        }
    }

    let waiter = CorrelationWaiter::new(nonce, deadline);
    Some(waiter.await_match(&mut subscribed, cancel).await)
}

fn outcome_event(outcome: Outcome) -> HandshakeEvent {
    if let Some(verification) = outcome.verification() {
        return HandshakeEvent::Matched(verification);
    }
    match outcome {
        Outcome::Cancelled => HandshakeEvent::Cancelled,
        Outcome::TransportFailed { cause } => {
            HandshakeEvent::TransportError(HandshakeError::TransportFailed(cause))
        }
        _ => HandshakeEvent::DeadlineElapsed,
    }
}

enum Bounded<T> {
    Done(T),
    Elapsed,
    Cancelled,
}

async fn bounded<F: std::future::Future>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: F,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        _ = tokio::time::sleep_until(deadline) => Bounded::Elapsed,
        out = fut => Bounded::Done(out),
    }
}
