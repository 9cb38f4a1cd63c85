//! Check-in handshake wire protocol.
//!
//! Every stage of a device's handshake travels on the single topic
//! `devices/{hid}/auth`; stages are told apart by the `stage` field of
//! the JSON [`Envelope`], not by sub-topics.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::HandshakeError;

/// Stage discriminator carried in [`Envelope::stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The initiator submits a nonce for the device to verify.
    NonceSubmit,
    /// The responder reports whether the nonce was accepted.
    NonceVerify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonceSubmit => "nonce_submit",
            Self::NonceVerify => "nonce_verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Identifiers ─────────────────────────────────────────────────

/// Opaque identifier of a physical machine (`hid`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate a device id. It ends up as one topic level, so MQTT
    /// wildcards and level separators are refused.
    pub fn new(hid: impl Into<String>) -> Result<Self, HandshakeError> {
        let hid = hid.into();
        if hid.trim().is_empty() {
            return Err(HandshakeError::InvalidInput("device id is empty".into()));
        }
        if hid.contains(['/', '+', '#']) {
            return Err(HandshakeError::InvalidInput(format!(
                "device id '{hid}' contains a topic separator or wildcard"
            )));
        }
        Ok(Self(hid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The topic that carries all handshake stages for this device.
    pub fn auth_topic(&self) -> String {
        format!("devices/{}/auth", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single-use correlation token. Equality is exact and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    pub fn new(nonce: impl Into<String>) -> Result<Self, HandshakeError> {
        let nonce = nonce.into();
        if nonce.is_empty() {
            return Err(HandshakeError::InvalidInput("nonce is empty".into()));
        }
        Ok(Self(nonce))
    }

    /// Fresh random nonce for a new login attempt.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Envelope ────────────────────────────────────────────────────

/// The JSON message exchanged on a device's auth topic.
///
/// Only `stage` and `nonce` are structural. Every other field is payload
/// and is read leniently: a value of an unexpected type is coerced or
/// dropped instead of failing the whole message, so an answer from a
/// loosely typed producer still correlates. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Absent for a plain check-in result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Correlation key. Only a JSON string counts.
    #[serde(default, deserialize_with = "string_only", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Producer wall clock in milliseconds. Informational only.
    #[serde(default, deserialize_with = "lenient_millis", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Verdict of a `nonce_verify`. Anything but `true` is a refusal.
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    /// Refusal or failure reason.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Check-in result: whether the LINE login succeeded.
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    /// LINE user id of the person checking in.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub line_user_id: Option<String>,
    /// LINE display name of the person checking in.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Free-form status reported alongside a check-in.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ── Lenient payload fields ──────────────────────────────────────

fn string_only<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Strings pass through; numbers, bools and objects are rendered as JSON.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => None,
        Value::Bool(b) => Some(b),
        _ => Some(false),
    })
}

/// Integer or fractional milliseconds, or an RFC 3339 string.
fn lenient_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.timestamp_millis()),
        _ => None,
    })
}

impl Envelope {
    /// `{stage: nonce_submit, nonce}` stamped with the current time.
    pub fn nonce_submit(nonce: &Nonce) -> Self {
        Self {
            stage: Some(Stage::NonceSubmit),
            nonce: Some(nonce.as_str().to_string()),
            timestamp: Some(now_millis()),
            ..Self::default()
        }
    }

    /// Verification answer for `nonce`.
    pub fn nonce_verify(nonce: &str, accepted: bool, error: Option<String>) -> Self {
        Self {
            stage: Some(Stage::NonceVerify),
            nonce: Some(nonce.to_string()),
            timestamp: Some(now_millis()),
            accepted: Some(accepted),
            error,
            ..Self::default()
        }
    }

    /// Plain check-in result built from a caller payload.
    pub fn checkin(payload: &CheckinPayload) -> Self {
        Self {
            stage: None,
            nonce: payload.nonce.as_ref().map(|n| n.as_str().to_string()),
            timestamp: Some(now_millis()),
            authenticated: Some(payload.authenticated),
            line_user_id: payload.line_user_id.clone(),
            display_name: payload.display_name.clone(),
            error: payload.error.clone(),
            status: payload.status.clone(),
            ..Self::default()
        }
    }

    /// True when this is the verification answer for `expected`.
    pub fn is_verification_of(&self, expected: &Nonce) -> bool {
        self.stage == Some(Stage::NonceVerify) && self.nonce.as_deref() == Some(expected.as_str())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Encode(e.to_string()))
    }

    /// Decode a payload. `None` for anything that is not a JSON object
    /// of the envelope shape; such traffic is ignored by every consumer.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Caller-supplied content of a plain check-in result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckinPayload {
    /// Whether the LINE login succeeded.
    pub authenticated: bool,
    /// Correlation key when the check-in result doubles as a challenge.
    pub nonce: Option<Nonce>,
    /// LINE user id, when authenticated.
    pub line_user_id: Option<String>,
    /// LINE display name, when authenticated.
    pub display_name: Option<String>,
    /// Why authentication failed.
    pub error: Option<String>,
    /// Free-form status for the device UI.
    pub status: Option<String>,
}

/// Outcome of a verification exchange as seen by the awaiting party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// The other party accepted the nonce.
    pub accepted: bool,
    /// Reason given with a refusal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verification {
    /// A missing `accepted` field is read as a refusal.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            accepted: envelope.accepted.unwrap_or(false),
            error: envelope.error.clone(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
