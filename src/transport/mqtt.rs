//! MQTT transport over `rumqttc`.
//!
//! Each [`MqttSession`] owns its client and event loop. Nothing happens on
//! the wire unless the event loop is polled, so every operation drives
//! the loop itself until the acknowledgement it is waiting for shows up.
//! Publishes received in the meantime are queued for `next_message`.
//!
//! The event loop is never polled again after an error: rumqttc would
//! reconnect, and a handshake makes exactly one connection attempt.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::checkin::error::HandshakeError;
use crate::checkin::session::{ChannelSession, Connector, InboundMessage};
use crate::config::BrokerConfig;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Request channel capacity between client and event loop.
const REQUEST_CAPACITY: usize = 16;

/// Upper bound on flushing a DISCONNECT during close.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Parsed broker location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl FromStr for BrokerAddress {
    type Err = HandshakeError;

    /// Accepts `mqtt://`, `tcp://`, `mqtts://`, `ssl://` or a bare `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (rest, tls) = match s.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => (rest, false),
            Some(("mqtts" | "ssl", rest)) => (rest, true),
            Some((scheme, _)) => {
                return Err(HandshakeError::InvalidInput(format!(
                    "unsupported broker scheme '{scheme}'"
                )))
            }
            None => (s, false),
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(HandshakeError::InvalidInput("broker host is empty".into()));
        }

        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    HandshakeError::InvalidInput(format!("invalid broker port '{port}'"))
                })?;
                (host, port)
            }
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(HandshakeError::InvalidInput("broker host is empty".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Opens one rumqttc connection per handshake.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    address: BrokerAddress,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            credentials: None,
            keep_alive: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self, HandshakeError> {
        let mut connector = Self::new(config.url.parse()?);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            connector.credentials = Some((user.clone(), pass.clone()));
        }
        connector.keep_alive = Duration::from_secs(config.keep_alive_secs.max(5));
        Ok(connector)
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.address.host.clone(), self.address.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user.clone(), pass.clone());
        }
        if self.address.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn open(&self, client_id: &str) -> Result<MqttSession, HandshakeError> {
        tracing::debug!(broker = %self.address, client_id, "connecting to broker");
        let (client, mut eventloop) = AsyncClient::new(self.options(client_id), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(HandshakeError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(HandshakeError::Connect(e.to_string())),
            }
        }

        tracing::debug!(broker = %self.address, client_id, "broker connection established");
        Ok(MqttSession {
            client,
            eventloop,
            inbox: VecDeque::new(),
            client_id: client_id.to_string(),
            failed: None,
            closed: false,
        })
    }
}

/// One live rumqttc connection.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    inbox: VecDeque<InboundMessage>,
    client_id: String,
    /// Set after the first event loop error; the loop is not polled again.
    failed: Option<String>,
    closed: bool,
}

/// What a drive step produced.
enum Step {
    SubAck(Vec<SubscribeReasonCode>),
    PubAck,
    Other,
}

impl MqttSession {
    /// Poll the event loop once, queueing inbound publishes.
    async fn step(&mut self) -> Result<Step, String> {
        if self.closed {
            return Err("session closed".into());
        }
        if let Some(reason) = &self.failed {
            return Err(reason.clone());
        }
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.inbox.push_back(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
                Ok(Step::Other)
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => Ok(Step::SubAck(ack.return_codes)),
            Ok(Event::Incoming(Packet::PubAck(_))) => Ok(Step::PubAck),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let reason = "broker sent disconnect".to_string();
                self.failed = Some(reason.clone());
                Err(reason)
            }
            Ok(_) => Ok(Step::Other),
            Err(e) => {
                let reason = e.to_string();
                self.failed = Some(reason.clone());
                Err(reason)
            }
        }
    }
}

#[async_trait]
impl ChannelSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), HandshakeError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| HandshakeError::Subscribe(e.to_string()))?;

        loop {
            match self.step().await.map_err(HandshakeError::Subscribe)? {
                Step::SubAck(codes) => {
                    if codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        return Err(HandshakeError::Subscribe(format!(
                            "broker rejected subscription to '{topic}'"
                        )));
                    }
                    tracing::debug!(client_id = %self.client_id, topic, "subscription acknowledged");
                    return Ok(());
                }
                Step::PubAck | Step::Other => {}
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), HandshakeError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| HandshakeError::Publish(e.to_string()))?;

        loop {
            match self.step().await.map_err(HandshakeError::Publish)? {
                Step::PubAck => {
                    tracing::debug!(client_id = %self.client_id, topic, "publish acknowledged");
                    return Ok(());
                }
                Step::SubAck(_) | Step::Other => {}
            }
        }
    }

    async fn next_message(&mut self) -> Result<InboundMessage, HandshakeError> {
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return Ok(msg);
            }
            self.step().await.map_err(HandshakeError::TransportFailed)?;
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbox.clear();

        if self.failed.is_some() {
            return;
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        // Flush the DISCONNECT; the socket is dropped with the session either way.
        let flushed = tokio::time::timeout(CLOSE_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::debug!(client_id = %self.client_id, "disconnect not flushed within grace period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rumqttc::{ConnAck, PubAck, Publish, SubAck};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    // ── Scripted broker ─────────────────────────────────────────

    /// Server side of one accepted connection, speaking MQTT 3.1.1.
    struct Wire {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Wire {
        /// Next packet from the client, or `None` once it hangs up.
        async fn recv(&mut self) -> Option<Packet> {
            loop {
                match rumqttc::mqttbytes::v4::read(&mut self.buf, 64 * 1024) {
                    Ok(packet) => return Some(packet),
                    Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                    Err(_) => return None,
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        }

        async fn send(
            &mut self,
            encode: impl FnOnce(&mut BytesMut) -> Result<usize, rumqttc::mqttbytes::Error>,
        ) {
            let mut out = BytesMut::new();
            encode(&mut out).unwrap();
            self.stream.write_all(&out).await.unwrap();
        }
    }

    async fn loopback() -> (TcpListener, MqttConnector) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = MqttConnector::new(BrokerAddress {
            host: "127.0.0.1".into(),
            port,
            tls: false,
        });
        (listener, connector)
    }

    /// Accept one client and complete CONNECT / CONNACK.
    async fn accept(listener: &TcpListener) -> Wire {
        let (stream, _) = listener.accept().await.unwrap();
        let mut wire = Wire {
            stream,
            buf: BytesMut::new(),
        };
        assert!(matches!(wire.recv().await, Some(Packet::Connect(_))));
        wire.send(|b| ConnAck::new(ConnectReturnCode::Success, false).write(b))
            .await;
        wire
    }

    const TOPIC: &str = "devices/vm-1/auth";
    const BOUND: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn subscribe_failure_code_is_a_subscribe_error() {
        let (listener, connector) = loopback().await;
        let broker = tokio::spawn(async move {
            let mut wire = accept(&listener).await;
            let Some(Packet::Subscribe(sub)) = wire.recv().await else {
                panic!("expected SUBSCRIBE");
            };
            wire.send(|b| SubAck::new(sub.pkid, vec![SubscribeReasonCode::Failure]).write(b))
                .await;
            while wire.recv().await.is_some() {}
        });

        let mut session = connector.open("t-suback").await.unwrap();
        let err = tokio::time::timeout(BOUND, session.subscribe(TOPIC))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Subscribe(_)));
        session.close().await;
        drop(session);
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn reply_arriving_before_puback_is_kept_for_next_message() {
        let (listener, connector) = loopback().await;
        let broker = tokio::spawn(async move {
            let mut wire = accept(&listener).await;
            let Some(Packet::Subscribe(sub)) = wire.recv().await else {
                panic!("expected SUBSCRIBE");
            };
            // Hold the SubAck back; subscribe must not return early.
            tokio::time::sleep(Duration::from_millis(200)).await;
            wire.send(|b| {
                SubAck::new(sub.pkid, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]).write(b)
            })
            .await;

            let Some(Packet::Publish(challenge)) = wire.recv().await else {
                panic!("expected PUBLISH");
            };
            // Answer first, acknowledge the challenge second.
            let mut reply = Publish::new(challenge.topic.clone(), QoS::AtLeastOnce, b"reply".to_vec());
            reply.pkid = 7;
            wire.send(|b| reply.write(b)).await;
            wire.send(|b| PubAck::new(challenge.pkid).write(b)).await;

            let acked = matches!(wire.recv().await, Some(Packet::PubAck(ack)) if ack.pkid == 7);
            (challenge.payload.to_vec(), acked)
        });

        let mut session = connector.open("t-order").await.unwrap();
        let started = std::time::Instant::now();
        tokio::time::timeout(BOUND, session.subscribe(TOPIC))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        tokio::time::timeout(BOUND, session.publish(TOPIC, b"challenge".to_vec()))
            .await
            .unwrap()
            .unwrap();
        let msg = tokio::time::timeout(BOUND, session.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, TOPIC);
        assert_eq!(msg.payload, b"reply");

        session.close().await;
        drop(session);
        let (challenge, acked) = broker.await.unwrap();
        assert_eq!(challenge, b"challenge");
        assert!(acked);
    }

    #[tokio::test]
    async fn lost_connection_is_terminal_and_never_redialed() {
        let (listener, connector) = loopback().await;
        let broker = tokio::spawn(async move {
            let wire = accept(&listener).await;
            drop(wire);
            // A second connection would mean the event loop reconnected.
            tokio::time::timeout(Duration::from_millis(500), listener.accept())
                .await
                .is_err()
        });

        let mut session = connector.open("t-drop").await.unwrap();
        let err = tokio::time::timeout(BOUND, session.next_message())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, HandshakeError::TransportFailed(_)));

        let again = tokio::time::timeout(BOUND, session.next_message())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(again, HandshakeError::TransportFailed(_)));
        let err = tokio::time::timeout(BOUND, session.subscribe(TOPIC))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Subscribe(_)));

        assert!(broker.await.unwrap(), "session reconnected after failure");
        session.close().await;
    }

    #[tokio::test]
    async fn close_sends_one_disconnect() {
        let (listener, connector) = loopback().await;
        let broker = tokio::spawn(async move {
            let mut wire = accept(&listener).await;
            let mut disconnects = 0;
            while let Some(packet) = wire.recv().await {
                if packet == Packet::Disconnect {
                    disconnects += 1;
                }
            }
            disconnects
        });

        let mut session = connector.open("t-close").await.unwrap();
        session.close().await;
        session.close().await;
        assert!(matches!(
            session.next_message().await,
            Err(HandshakeError::TransportFailed(_))
        ));
        drop(session);

        assert_eq!(tokio::time::timeout(BOUND, broker).await.unwrap().unwrap(), 1);
    }

    #[test]
    fn parses_schemes_and_default_ports() {
        let a: BrokerAddress = "mqtt://broker.local:1884".parse().unwrap();
        assert_eq!((a.host.as_str(), a.port, a.tls), ("broker.local", 1884, false));

        let a: BrokerAddress = "tcp://10.0.0.2".parse().unwrap();
        assert_eq!((a.host.as_str(), a.port, a.tls), ("10.0.0.2", 1883, false));

        let a: BrokerAddress = "mqtts://broker.example.com".parse().unwrap();
        assert_eq!((a.port, a.tls), (8883, true));

        let a: BrokerAddress = "localhost".parse().unwrap();
        assert_eq!((a.host.as_str(), a.port), ("localhost", 1883));
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!("ws://broker:9001".parse::<BrokerAddress>().is_err());
        assert!("mqtt://".parse::<BrokerAddress>().is_err());
        assert!("mqtt://host:notaport".parse::<BrokerAddress>().is_err());
        assert!(":1883".parse::<BrokerAddress>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let a: BrokerAddress = "ssl://b:8884".parse().unwrap();
        assert_eq!(a.to_string(), "mqtts://b:8884");
        assert_eq!(a.to_string().parse::<BrokerAddress>().unwrap(), a);
    }

    #[test]
    fn connector_from_config_carries_credentials() {
        let config = BrokerConfig {
            url: "mqtt://b:1883".into(),
            username: Some("u".into()),
            password: Some("p".into()),
            keep_alive_secs: 1,
        };
        let connector = MqttConnector::from_config(&config).unwrap();
        assert_eq!(connector.credentials, Some(("u".into(), "p".into())));
        assert_eq!(connector.keep_alive, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_to_connect() {
        // Port 1 on loopback refuses connections.
        let connector = MqttConnector::new("mqtt://127.0.0.1:1".parse().unwrap());
        let err = tokio::time::timeout(Duration::from_secs(10), connector.open("t-unreachable"))
            .await
            .expect("refused connect should fail fast")
            .err()
            .unwrap();
        assert!(matches!(err, HandshakeError::Connect(_)));
    }
}
