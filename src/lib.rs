//! Device check-in authentication handshake over MQTT.
//!
//! The mobile side publishes a challenge on `devices/{hid}/auth` and waits
//! for the device's `nonce_verify` reply; the device side answers each
//! challenge once. See [`checkin`] for the protocol pieces and
//! [`transport`] for the broker connectors.

pub mod checkin;
pub mod config;
pub mod transport;

pub use checkin::{
    Challenge, CheckinPayload, DeviceId, HandshakeCoordinator, HandshakeError, Nonce,
    Verification,
};
pub use config::Config;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use config::{BrokerConfig, HandshakeConfig};
use transport::MqttConnector;

/// Publish a check-in result for `hid` with default handshake settings.
pub async fn publish_checkin(
    broker: &BrokerConfig,
    hid: &str,
    payload: &CheckinPayload,
) -> Result<(), HandshakeError> {
    let hid = DeviceId::new(hid)?;
    let coordinator =
        HandshakeCoordinator::new(MqttConnector::from_config(broker)?, HandshakeConfig::default());
    coordinator.publish_checkin(&hid, payload).await
}

/// Publish `challenge` for `hid` and wait up to `timeout` for the
/// matching verification, with default handshake settings.
pub async fn publish_and_await_nonce_verification(
    broker: &BrokerConfig,
    hid: &str,
    challenge: Challenge,
    timeout: Duration,
) -> Result<Verification, HandshakeError> {
    let hid = DeviceId::new(hid)?;
    let coordinator =
        HandshakeCoordinator::new(MqttConnector::from_config(broker)?, HandshakeConfig::default());
    coordinator
        .publish_and_await_nonce_verification(&hid, challenge, timeout, &CancellationToken::new())
        .await
}
