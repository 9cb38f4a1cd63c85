//! End-to-end handshake behaviour over the in-process broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use checkin_handshake::checkin::{
    AcceptAll, ChannelSession, Challenge, CheckinPayload, Connector, DeviceId, Envelope,
    HandshakeCoordinator, HandshakeError, Nonce, NonceResponder, SequentialOperationIds, Stage,
    Verification,
};
use checkin_handshake::config::{ChallengeKind, HandshakeConfig, ResponderConfig};
use checkin_handshake::transport::{BrokerEvent, MemoryBroker};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "devices/vm-17/auth";
const DEADLINE: Duration = Duration::from_secs(15);

fn hid() -> DeviceId {
    DeviceId::new("vm-17").unwrap()
}

fn nonce(s: &str) -> Nonce {
    Nonce::new(s).unwrap()
}

fn coordinator(broker: &MemoryBroker) -> HandshakeCoordinator<MemoryBroker> {
    HandshakeCoordinator::new(broker.clone(), HandshakeConfig::default())
        .with_operation_ids(Arc::new(SequentialOperationIds::default()))
}

/// A scripted device: subscribed before this returns, then answers every
/// `nonce_submit` after `delay` with whatever `reply` builds for its nonce.
async fn scripted_device<F>(broker: &MemoryBroker, delay: Duration, reply: F) -> JoinHandle<()>
where
    F: Fn(&str) -> Vec<Envelope> + Send + 'static,
{
    let mut session = broker.open("device-sim").await.unwrap();
    session.subscribe(TOPIC).await.unwrap();
    tokio::spawn(async move {
        while let Ok(msg) = session.next_message().await {
            let Some(envelope) = Envelope::from_bytes(&msg.payload) else {
                continue;
            };
            if envelope.stage != Some(Stage::NonceSubmit) {
                continue;
            }
            let Some(n) = envelope.nonce.as_deref() else {
                continue;
            };
            tokio::time::sleep(delay).await;
            for answer in reply(n) {
                if session.publish(TOPIC, answer.to_bytes().unwrap()).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Every handshake client id was connected once and closed once.
fn assert_closed_exactly_once(broker: &MemoryBroker, prefix: &str) {
    let mut connected: HashMap<String, usize> = HashMap::new();
    let mut closed: HashMap<String, usize> = HashMap::new();
    for event in broker.events() {
        match event {
            BrokerEvent::Connected { client_id } if client_id.starts_with(prefix) => {
                *connected.entry(client_id).or_default() += 1;
            }
            BrokerEvent::Closed { client_id } if client_id.starts_with(prefix) => {
                *closed.entry(client_id).or_default() += 1;
            }
            _ => {}
        }
    }
    assert!(!connected.is_empty(), "no '{prefix}' connections observed");
    for (client_id, n) in &connected {
        assert_eq!(*n, 1, "{client_id} connected {n} times");
        assert_eq!(closed.get(client_id), Some(&1), "{client_id} not closed exactly once");
    }
    assert_eq!(connected.len(), closed.len());
}

// ── Scenarios ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn matching_acceptance_resolves_before_deadline() {
    let broker = MemoryBroker::new();
    let device = scripted_device(&broker, Duration::from_secs(2), |n| {
        vec![Envelope::nonce_verify(n, true, None)]
    })
    .await;

    let started = Instant::now();
    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();

    assert_eq!(
        verification,
        Verification {
            accepted: true,
            error: None
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < DEADLINE);
    assert_closed_exactly_once(&broker, "liff-nonce-");
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn mismatched_nonce_is_ignored_until_deadline() {
    let broker = MemoryBroker::new();
    let device = scripted_device(&broker, Duration::from_secs(2), |_| {
        vec![Envelope::nonce_verify("xyz999", true, None)]
    })
    .await;

    let started = Instant::now();
    let err = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap_err();

    assert_eq!(err, HandshakeError::TimedOut(DEADLINE));
    let elapsed = started.elapsed();
    assert!(elapsed >= DEADLINE, "resolved early after {elapsed:?}");
    assert!(elapsed < DEADLINE + Duration::from_secs(1));
    assert!(broker
        .published_on(TOPIC)
        .iter()
        .any(|e| e.nonce.as_deref() == Some("xyz999")));
    assert_closed_exactly_once(&broker, "liff-nonce-");
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn rejection_returns_immediately_with_reason() {
    let broker = MemoryBroker::new();
    let device = scripted_device(&broker, Duration::ZERO, |n| {
        vec![Envelope::nonce_verify(n, false, Some("expired".into()))]
    })
    .await;

    let started = Instant::now();
    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();

    assert!(!verification.accepted);
    assert_eq!(verification.error.as_deref(), Some("expired"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_closed_exactly_once(&broker, "liff-nonce-");
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_fails_within_connect_window() {
    let broker = MemoryBroker::new();
    broker.set_unreachable(true);

    let started = Instant::now();
    let err = coordinator(&broker)
        .publish_checkin(
            &hid(),
            &CheckinPayload {
                authenticated: true,
                ..CheckinPayload::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HandshakeError::Connect(_)));
    assert!(err.is_transport());
    assert!(started.elapsed() <= HandshakeConfig::default().connect_timeout());
    assert_eq!(broker.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_broker_fails_at_connect_timeout_well_before_deadline() {
    let broker = MemoryBroker::new();
    broker.set_hang_connect(true);

    let started = Instant::now();
    let err = coordinator(&broker)
        .publish_checkin(&hid(), &CheckinPayload::default())
        .await
        .unwrap_err();

    assert!(matches!(err, HandshakeError::Connect(_)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < DEADLINE);
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_resolves_once_with_first_content() {
    let broker = MemoryBroker::new();
    broker.set_duplicate_deliveries(2);
    // A conflicting late answer must not override the first one either.
    let device = scripted_device(&broker, Duration::from_millis(100), |n| {
        vec![
            Envelope::nonce_verify(n, true, None),
            Envelope::nonce_verify(n, false, Some("late".into())),
        ]
    })
    .await;

    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();

    assert!(verification.accepted);
    assert_eq!(verification.error, None);
    assert_closed_exactly_once(&broker, "liff-nonce-");
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn loosely_typed_answer_is_not_mistaken_for_silence() {
    let broker = MemoryBroker::new();
    let mut device = broker.open("device-sim").await.unwrap();
    device.subscribe(TOPIC).await.unwrap();
    let answering = tokio::spawn(async move {
        while let Ok(msg) = device.next_message().await {
            let is_challenge = Envelope::from_bytes(&msg.payload)
                .is_some_and(|e| e.stage == Some(Stage::NonceSubmit));
            if is_challenge {
                let raw = br#"{"stage":"nonce_verify","nonce":"abc123","accepted":false,
                    "error":{"code":"expired"},"timestamp":1760000000000.5,"status":200}"#;
                device.publish(TOPIC, raw.to_vec()).await.unwrap();
            }
        }
    });

    let started = Instant::now();
    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();

    assert!(!verification.accepted);
    assert_eq!(verification.error.as_deref(), Some(r#"{"code":"expired"}"#));
    assert!(started.elapsed() < DEADLINE);
    answering.abort();
}

// ── Properties ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_handshakes_do_not_cross_talk() {
    let broker = MemoryBroker::new();
    let device = scripted_device(&broker, Duration::from_millis(500), |n| match n {
        "n-one" => vec![Envelope::nonce_verify(n, true, None)],
        _ => vec![Envelope::nonce_verify(n, false, Some("unknown user".into()))],
    })
    .await;

    let coordinator = coordinator(&broker);
    let hid = hid();
    let (one, two) = tokio::join!(
        coordinator.submit_nonce_and_wait(&hid, nonce("n-one"), DEADLINE),
        coordinator.submit_nonce_and_wait(&hid, nonce("n-two"), DEADLINE),
    );

    assert_eq!(
        one.unwrap(),
        Verification {
            accepted: true,
            error: None
        }
    );
    assert_eq!(
        two.unwrap(),
        Verification {
            accepted: false,
            error: Some("unknown user".into())
        }
    );
    assert_closed_exactly_once(&broker, "liff-nonce-");
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn subscription_is_acknowledged_before_challenge_goes_out() {
    let broker = MemoryBroker::new();
    broker.set_subscribe_ack_delay(Some(Duration::from_secs(1)));
    // The device answers at once; the subscription must already be in place.
    let device = scripted_device(&broker, Duration::ZERO, |n| {
        vec![Envelope::nonce_verify(n, true, None)]
    })
    .await;

    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();
    assert!(verification.accepted);

    let acked = broker
        .position_of(|e| {
            matches!(e, BrokerEvent::SubscribeAcked { client_id, .. } if client_id == "liff-nonce-op-1")
        })
        .unwrap();
    let challenged = broker
        .position_of(|e| {
            matches!(e, BrokerEvent::Published { client_id: Some(c), .. } if c == "liff-nonce-op-1")
        })
        .unwrap();
    assert!(acked < challenged);
    device.abort();
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_surfaces_transport_failure_and_releases() {
    let broker = MemoryBroker::new();
    let dropper = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        dropper.drop_connections();
    });

    let err = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap_err();

    assert!(matches!(err, HandshakeError::TransportFailed(_)));
    assert!(!err.is_timeout());
    assert_closed_exactly_once(&broker, "liff-nonce-");
    assert_eq!(broker.live_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_exit_path_releases_its_connection() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator(&broker);

    // Timeout with no counterpart.
    let _ = coordinator
        .submit_nonce_and_wait(&hid(), nonce("t-1"), Duration::from_secs(1))
        .await;
    // Rejected subscribe.
    broker.set_reject_subscribe(true);
    let _ = coordinator
        .submit_nonce_and_wait(&hid(), nonce("t-2"), Duration::from_secs(1))
        .await;
    broker.set_reject_subscribe(false);
    // Rejected publish.
    broker.set_reject_publish(true);
    let _ = coordinator
        .publish_checkin(&hid(), &CheckinPayload::default())
        .await;
    broker.set_reject_publish(false);
    // Success.
    coordinator
        .publish_checkin(&hid(), &CheckinPayload::default())
        .await
        .unwrap();

    assert_eq!(broker.opened(), 4);
    assert_eq!(broker.released(), 4);
    assert_eq!(broker.live_connections(), 0);
    assert_closed_exactly_once(&broker, "liff-");
}

// ── Both sides ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn responder_and_coordinator_complete_a_handshake() {
    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();
    let responder = NonceResponder::new(
        broker.clone(),
        AcceptAll,
        HandshakeConfig::default(),
        ResponderConfig::default(),
    );
    let serve = {
        let cancel = cancel.clone();
        tokio::spawn(async move { responder.run(&hid(), &cancel).await })
    };
    while broker.position_of(|e| matches!(e, BrokerEvent::SubscribeAcked { .. })).is_none() {
        tokio::task::yield_now().await;
    }

    let verification = coordinator(&broker)
        .submit_nonce_and_wait(&hid(), nonce("abc123"), DEADLINE)
        .await
        .unwrap();
    assert!(verification.accepted);

    cancel.cancel();
    let stats = serve.await.unwrap().unwrap();
    assert_eq!(stats.answered, 1);
    assert_eq!(broker.released(), broker.opened());
}

#[tokio::test(start_paused = true)]
async fn checkin_result_can_serve_as_the_challenge() {
    let broker = MemoryBroker::new();
    let settings = HandshakeConfig {
        challenge: ChallengeKind::CheckinResult,
        ..HandshakeConfig::default()
    };
    let cancel = CancellationToken::new();
    let responder = NonceResponder::new(
        broker.clone(),
        AcceptAll,
        settings.clone(),
        ResponderConfig::default(),
    );
    let serve = {
        let cancel = cancel.clone();
        tokio::spawn(async move { responder.run(&hid(), &cancel).await })
    };
    while broker.position_of(|e| matches!(e, BrokerEvent::SubscribeAcked { .. })).is_none() {
        tokio::task::yield_now().await;
    }

    let coordinator = HandshakeCoordinator::new(broker.clone(), settings.clone());
    let challenge = Challenge::for_kind(
        settings.challenge,
        nonce("liff-42"),
        CheckinPayload {
            authenticated: true,
            line_user_id: Some("U1234".into()),
            display_name: Some("Kim".into()),
            ..CheckinPayload::default()
        },
    );
    let verification = coordinator
        .publish_and_await_nonce_verification(&hid(), challenge, DEADLINE, &CancellationToken::new())
        .await
        .unwrap();
    assert!(verification.accepted);

    let published = broker.published_on(TOPIC);
    assert_eq!(published[0].stage, None);
    assert_eq!(published[0].line_user_id.as_deref(), Some("U1234"));
    assert_eq!(published[1].stage, Some(Stage::NonceVerify));
    assert_eq!(published[1].nonce.as_deref(), Some("liff-42"));

    cancel.cancel();
    serve.await.unwrap().unwrap();
}
