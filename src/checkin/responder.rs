//! Device-side responder.
//!
//! The counterpart of the awaiting party: listens on a device's auth
//! topic, hands every challenge to a [`NonceVerifier`], and answers with
//! a `nonce_verify` envelope carrying the same nonce.
//!
//! QoS 1 means the same challenge can arrive more than once. Answered
//! nonces are remembered in a [`SeenNonces`] window so each is answered
//! once; the awaiting side is duplicate-tolerant anyway, this just keeps
//! the topic quiet.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::error::HandshakeError;
use super::protocol::{now_millis, DeviceId, Envelope, Nonce, Stage, Verification};
use super::session::{
    client_id, ChannelSession, Connector, OperationIds, RandomOperationIds, Subscribed,
};
use crate::config::{ChallengeKind, HandshakeConfig, ResponderConfig};

// ── Verifiers ───────────────────────────────────────────────────

/// Decides whether a submitted nonce is accepted.
#[async_trait]
pub trait NonceVerifier: Send + Sync {
    async fn verify(&self, hid: &DeviceId, challenge: &Envelope) -> Verification;
}

/// Accepts every nonce.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl NonceVerifier for AcceptAll {
    async fn verify(&self, _hid: &DeviceId, _challenge: &Envelope) -> Verification {
        Verification {
            accepted: true,
            error: None,
        }
    }
}

/// Refuses every nonce with a fixed reason.
#[derive(Debug, Clone)]
pub struct RejectAll {
    pub reason: String,
}

#[async_trait]
impl NonceVerifier for RejectAll {
    async fn verify(&self, _hid: &DeviceId, _challenge: &Envelope) -> Verification {
        Verification {
            accepted: false,
            error: Some(self.reason.clone()),
        }
    }
}

/// Refuses challenges stamped longer than `max_age` ago with `"expired"`,
/// otherwise defers to `inner`.
pub struct ExpiringNonceVerifier<V> {
    inner: V,
    max_age: Duration,
}

impl<V: NonceVerifier> ExpiringNonceVerifier<V> {
    pub fn new(inner: V, max_age: Duration) -> Self {
        Self { inner, max_age }
    }
}

#[async_trait]
impl<V: NonceVerifier> NonceVerifier for ExpiringNonceVerifier<V> {
    async fn verify(&self, hid: &DeviceId, challenge: &Envelope) -> Verification {
        let Some(stamped) = challenge.timestamp else {
            return Verification {
                accepted: false,
                error: Some("missing timestamp".into()),
            };
        };
        let age_ms = now_millis().saturating_sub(stamped);
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        if age_ms > max_age_ms {
            return Verification {
                accepted: false,
                error: Some("expired".into()),
            };
        }
        self.inner.verify(hid, challenge).await
    }
}

// ── Duplicate suppression ───────────────────────────────────────

/// Bounded window of recently answered nonces with TTL expiry.
pub struct SeenNonces {
    /// nonce -> expiry
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl SeenNonces {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record `nonce`. True if it was not already in the window.
    pub fn remember(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(expires_at) = entries.get(nonce) {
            if *expires_at > now {
                return false;
            }
        }

        if entries.len() >= self.capacity {
            entries.retain(|_, expires_at| *expires_at > now);
        }
        // Still full: evict whatever expires soonest.
        if entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, expires_at)| **expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(nonce.to_string(), now + self.ttl);
        true
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Responder ───────────────────────────────────────────────────

/// Counters reported when a responder stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponderStats {
    pub answered: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

/// Answers challenges on one device's topic until cancelled.
pub struct NonceResponder<C: Connector, V: NonceVerifier> {
    connector: C,
    verifier: V,
    handshake: HandshakeConfig,
    config: ResponderConfig,
    ids: Arc<dyn OperationIds>,
}

impl<C: Connector, V: NonceVerifier> NonceResponder<C, V> {
    pub fn new(connector: C, verifier: V, handshake: HandshakeConfig, config: ResponderConfig) -> Self {
        Self {
            connector,
            verifier,
            handshake,
            config,
            ids: Arc::new(RandomOperationIds),
        }
    }

    pub fn with_operation_ids(mut self, ids: Arc<dyn OperationIds>) -> Self {
        self.ids = ids;
        self
    }

    /// Serve `hid` until `cancel` fires (`Ok`) or the connection fails (`Err`).
    /// One connection attempt; the session is closed on every exit.
    pub async fn run(
        &self,
        hid: &DeviceId,
        cancel: &CancellationToken,
    ) -> Result<ResponderStats, HandshakeError> {
        let client_id = client_id(&self.config.client_prefix, &self.ids.next_operation_id());
        let connect_timeout = self.handshake.connect_timeout();

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ResponderStats::default()),
            opened = tokio::time::timeout(connect_timeout, self.connector.open(&client_id)) => match opened {
                Ok(session) => session?,
                Err(_) => {
                    return Err(HandshakeError::Connect(format!(
                        "no broker acknowledgement within {connect_timeout:?}"
                    )))
                }
            },
        };

        tracing::info!(hid = %hid, client_id = %client_id, "responder listening");
        let result = self.serve(&mut session, hid, cancel).await;
        session.close().await;

        match &result {
            Ok(stats) => tracing::info!(
                hid = %hid,
                answered = stats.answered,
                duplicates = stats.duplicates,
                "responder stopped"
            ),
            Err(e) => tracing::warn!(hid = %hid, "responder failed: {e}"),
        }
        result
    }

    async fn serve(
        &self,
        session: &mut C::Session,
        hid: &DeviceId,
        cancel: &CancellationToken,
    ) -> Result<ResponderStats, HandshakeError> {
        let topic = hid.auth_topic();
        let seen = SeenNonces::new(
            Duration::from_secs(self.config.seen_ttl_secs),
            self.config.seen_capacity,
        );
        let mut stats = ResponderStats::default();

        let mut subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(stats),
            subscribed = Subscribed::acquire(session, &topic) => subscribed?,
        };

        loop {
            let inbound = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(stats),
                inbound = subscribed.next_message() => inbound?,
            };
            if inbound.topic != topic {
                stats.ignored += 1;
                continue;
            }
            let Some(envelope) = Envelope::from_bytes(&inbound.payload) else {
                stats.ignored += 1;
                continue;
            };
            let Some(nonce) = self.challenge_nonce(&envelope) else {
                stats.ignored += 1;
                continue;
            };
            if !seen.remember(nonce.as_str()) {
                stats.duplicates += 1;
                tracing::debug!(hid = %hid, nonce = %nonce, "duplicate challenge ignored");
                continue;
            }

            let verdict = self.verifier.verify(hid, &envelope).await;
            let reply = Envelope::nonce_verify(nonce.as_str(), verdict.accepted, verdict.error.clone());
            subscribed.publish(reply.to_bytes()?).await?;

            stats.answered += 1;
            if verdict.accepted {
                stats.accepted += 1;
            }
            tracing::info!(
                hid = %hid,
                accepted = verdict.accepted,
                error = verdict.error.as_deref().unwrap_or(""),
                "answered challenge"
            );
        }
    }

    /// Nonce of a challenge of the configured kind, or `None`.
    fn challenge_nonce(&self, envelope: &Envelope) -> Option<Nonce> {
        let is_challenge = match self.handshake.challenge {
            ChallengeKind::NonceSubmit => envelope.stage == Some(Stage::NonceSubmit),
            ChallengeKind::CheckinResult => envelope.stage.is_none(),
        };
        if !is_challenge {
            return None;
        }
        envelope.nonce.as_deref().and_then(|n| Nonce::new(n).ok())
    }
}
