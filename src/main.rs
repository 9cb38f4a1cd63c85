//! `checkin`: run either side of the device check-in handshake from a shell.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use checkin_handshake::checkin::{
    AcceptAll, Challenge, CheckinPayload, DeviceId, ExpiringNonceVerifier, HandshakeCoordinator,
    HandshakeError, Nonce, NonceResponder, NonceVerifier, RejectAll,
};
use checkin_handshake::config::Config;
use checkin_handshake::transport::MqttConnector;

const EXIT_FAILURE: u8 = 1;
const EXIT_REJECTED: u8 = 2;
const EXIT_TIMED_OUT: u8 = 3;

#[derive(Parser)]
#[command(name = "checkin")]
#[command(version, about = "Device check-in authentication handshake over MQTT")]
struct Cli {
    /// Path to configuration file (default: ~/.checkin/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a challenge and wait for the device's verification
    SubmitNonce {
        /// Device (vending machine) identifier
        #[arg(long)]
        hid: String,
        /// Nonce to submit; a random one is generated when omitted
        #[arg(long)]
        nonce: Option<String>,
        /// Deadline in milliseconds (default: handshake.verify_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Publish a check-in result without waiting for a reply
    PublishCheckin {
        #[arg(long)]
        hid: String,
        #[arg(long, action = clap::ArgAction::Set)]
        authenticated: bool,
        #[arg(long)]
        line_user_id: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        error: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },

    /// Answer challenges for a device until interrupted
    Respond {
        #[arg(long)]
        hid: String,
        /// Refuse every challenge with this reason
        #[arg(long)]
        reject_all: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::SubmitNonce {
            hid,
            nonce,
            timeout_ms,
        } => submit_nonce(&config, &hid, nonce, timeout_ms).await,
        Commands::PublishCheckin {
            hid,
            authenticated,
            line_user_id,
            display_name,
            error,
            status,
        } => {
            let hid = DeviceId::new(hid)?;
            let payload = CheckinPayload {
                authenticated,
                nonce: None,
                line_user_id,
                display_name,
                error,
                status,
            };
            let coordinator = coordinator(&config)?;
            coordinator
                .publish_checkin(&hid, &payload)
                .await
                .context("check-in publish failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Respond { hid, reject_all } => respond(&config, &hid, reject_all).await,
        Commands::Config => {
            println!("# {}", config.config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn coordinator(config: &Config) -> Result<HandshakeCoordinator<MqttConnector>> {
    let connector = MqttConnector::from_config(&config.broker)?;
    Ok(HandshakeCoordinator::new(connector, config.handshake.clone()))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

async fn submit_nonce(
    config: &Config,
    hid: &str,
    nonce: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<ExitCode> {
    let hid = DeviceId::new(hid)?;
    let nonce = match nonce {
        Some(n) => Nonce::new(n)?,
        None => Nonce::generate(),
    };
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.handshake.verify_timeout());
    let challenge = Challenge::for_kind(
        config.handshake.challenge,
        nonce,
        CheckinPayload {
            authenticated: true,
            ..CheckinPayload::default()
        },
    );

    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    let coordinator = coordinator(config)?;
    match coordinator
        .publish_and_await_nonce_verification(&hid, challenge, timeout, &cancel)
        .await
    {
        Ok(verification) => {
            println!("{}", serde_json::to_string(&verification)?);
            if verification.accepted {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_REJECTED))
            }
        }
        Err(HandshakeError::TimedOut(elapsed)) => {
            eprintln!("no verification from {hid} within {elapsed:?}");
            Ok(ExitCode::from(EXIT_TIMED_OUT))
        }
        Err(e) => {
            eprintln!("handshake failed: {e}");
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}

async fn respond(config: &Config, hid: &str, reject_all: Option<String>) -> Result<ExitCode> {
    let hid = DeviceId::new(hid)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    let max_age = config.responder.max_challenge_age_secs;
    match reject_all {
        Some(reason) => run_responder(config, &hid, RejectAll { reason }, &cancel).await,
        None if max_age > 0 => {
            let verifier = ExpiringNonceVerifier::new(AcceptAll, Duration::from_secs(max_age));
            run_responder(config, &hid, verifier, &cancel).await
        }
        None => run_responder(config, &hid, AcceptAll, &cancel).await,
    }
}

async fn run_responder<V: NonceVerifier>(
    config: &Config,
    hid: &DeviceId,
    verifier: V,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let connector = MqttConnector::from_config(&config.broker)?;
    let responder = NonceResponder::new(
        connector,
        verifier,
        config.handshake.clone(),
        config.responder.clone(),
    );
    let stats = responder
        .run(hid, cancel)
        .await
        .with_context(|| format!("responder for {hid} stopped"))?;
    println!(
        "answered={} accepted={} duplicates={} ignored={}",
        stats.answered, stats.accepted, stats.duplicates, stats.ignored
    );
    Ok(ExitCode::SUCCESS)
}
