use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use conclave_core::events::MediaConnectionState;
use conclave_core::{
    ConclaveError, Conference, ConferenceConfig, ConferenceEvent, ConferenceEventListener,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{error, info, warn};

// Matches the `conclave.*` targets of the core as well as `conclave_cli`.
const DEFAULT_FILTER: &str = "conclave=info";

#[derive(Parser, Debug)]
#[command(
    name = "conclave",
    about = "Join a conference from the terminal: prints events, sends stdin lines as chat"
)]
struct Cli {
    /// Path to the conference JSON config.
    config: PathBuf,
    /// Conference PIN, when one is required.
    #[arg(long, env = "CONCLAVE_PIN")]
    pin: Option<String>,
    /// Display name overriding the one in the config file.
    #[arg(long)]
    display_name: Option<String>,
}

/// Prints every event and wakes the main loop when the node ends the session.
struct Printer {
    ended: Arc<Notify>,
}

impl ConferenceEventListener for Printer {
    fn on_event(&self, event: ConferenceEvent) {
        if matches!(event, ConferenceEvent::Bye | ConferenceEvent::Disconnect { .. }) {
            self.ended.notify_one();
        }
        println!("{}", describe(&event));
    }
}

fn describe(event: &ConferenceEvent) -> String {
    match event {
        ConferenceEvent::PresentationStart { presenter_name, .. } => {
            format!("* {presenter_name} started presenting")
        }
        ConferenceEvent::PresentationStop => "* presentation stopped".to_string(),
        ConferenceEvent::MessageReceived(msg) => format!("<{}> {}", msg.sender_name, msg.text),
        ConferenceEvent::MessageSent(msg) => format!("<me> {}", msg.text),
        ConferenceEvent::Disconnect { reason } => format!("* disconnected: {reason}"),
        ConferenceEvent::Bye => "* conference ended".to_string(),
        ConferenceEvent::IncomingCall {
            remote_display_name,
            conference_alias,
            ..
        } => format!("* incoming call from {remote_display_name} ({conference_alias})"),
        ConferenceEvent::IncomingCancelled { .. } => "* incoming call cancelled".to_string(),
        ConferenceEvent::CameraControl(cmd) => format!("* camera control {:?}", cmd.action),
        ConferenceEvent::ParticipantJoined(p) => format!("* {} joined", p.display_name),
        ConferenceEvent::ParticipantUpdated(p) => {
            let muted = if p.is_muted { " (muted)" } else { "" };
            format!("* {} updated{muted}", p.display_name)
        }
        ConferenceEvent::ParticipantLeft(id) => format!("* participant {id} left"),
        ConferenceEvent::TokenRefreshFailed(e) => format!("! session token renewal failed: {e}"),
        ConferenceEvent::EventStreamReconnecting { attempt } => {
            format!("! reconnecting event stream (attempt {attempt})")
        }
        ConferenceEvent::MediaConnectionChanged(state) => match state {
            MediaConnectionState::Connecting => "* media connecting".to_string(),
            MediaConnectionState::Connected => "* media connected".to_string(),
            MediaConnectionState::Disconnected => "* media disconnected".to_string(),
            MediaConnectionState::Failed => "! media failed".to_string(),
        },
        ConferenceEvent::LocalTrackChanged { role, active } => {
            format!("* local {role} {}", if *active { "on" } else { "off" })
        }
        ConferenceEvent::RemoteTrackChanged { role, active } => {
            format!("* remote {role} {}", if *active { "on" } else { "off" })
        }
    }
}

async fn run(cli: Cli) -> Result<(), ConclaveError> {
    let mut config = ConferenceConfig::from_file(&cli.config)?;
    if let Some(name) = cli.display_name {
        config.display_name = name;
    }

    let ended = Arc::new(Notify::new());
    let printer: Arc<dyn ConferenceEventListener> = Arc::new(Printer {
        ended: ended.clone(),
    });
    let conference =
        Conference::join_with_listeners(&config, cli.pin.as_deref(), vec![printer]).await?;
    info!(
        participant = %conference.context().participant_id,
        "joined {}, type to chat, Ctrl-D to leave",
        config.conference_alias
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = ended.notified() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = conference.send_message(&line).await {
                        warn!(error = %e, "message not sent");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    break;
                }
            },
        }
    }

    conference.leave().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "conclave failed");
            ExitCode::FAILURE
        }
    }
}
