use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand};
use greenroom::call::{CallConfig, CallError, CallEvent, CallSession};
use greenroom::media::{MediaConstraints, SyntheticDevices};
use greenroom::relay::ParticipantRole;
use greenroom::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use greenroom::transport::ConnectionState;
use greenroom::transport::webrtc::RtcConnector;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    let relay_base = cli.relay_server;

    match cli.command {
        Some(Command::Join(args)) => handle_join(&relay_base, args).await,
        Some(Command::Start(args)) => handle_start(&relay_base, args).await,
        None => handle_start(&relay_base, StartArgs::default()).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "greenroom",
    about = "🎬 Two-party interview calls over WebRTC with polled relay signaling",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "GREENROOM_RELAY",
        default_value = "http://127.0.0.1:4400",
        help = "Base URL for the greenroom signaling relay"
    )]
    relay_server: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "GREENROOM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "GREENROOM_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new interview session (default when no subcommand given)
    Start(StartArgs),
    /// Join an existing session using a session id or share URL
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    #[arg(
        long,
        value_enum,
        default_value_t = ParticipantRole::Interviewer,
        help = "Role to take in the call"
    )]
    role: ParticipantRole,

    #[command(flatten)]
    media: MediaArgs,
}

impl Default for StartArgs {
    fn default() -> Self {
        Self {
            role: ParticipantRole::Interviewer,
            media: MediaArgs::default(),
        }
    }
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(value_name = "SESSION", help = "Session id or share URL")]
    target: String,

    #[arg(
        long,
        value_enum,
        default_value_t = ParticipantRole::Candidate,
        help = "Role to take in the call"
    )]
    role: ParticipantRole,

    #[command(flatten)]
    media: MediaArgs,
}

#[derive(Args, Debug, Default, Clone)]
struct MediaArgs {
    #[arg(
        long = "audio-only",
        action = clap::ArgAction::SetTrue,
        help = "Skip camera capture and run audio-only"
    )]
    audio_only: bool,

    #[arg(
        long = "no-media",
        action = clap::ArgAction::SetTrue,
        help = "Join without microphone or camera"
    )]
    no_media: bool,
}

impl MediaArgs {
    fn constraints(&self) -> MediaConstraints {
        if self.no_media {
            MediaConstraints::disabled()
        } else if self.audio_only {
            MediaConstraints::audio_only()
        } else {
            MediaConstraints::default()
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("unable to determine session id from '{target}'")]
    InvalidSessionTarget { target: String },
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

async fn handle_start(base_url: &str, args: StartArgs) -> Result<(), CliError> {
    let config = CallConfig::new(base_url)?;
    let session_id = Uuid::new_v4().to_string();
    print_start_banner(&session_id, config.base_url().as_str(), args.role);
    run_call(config, session_id, args.role, args.media.constraints()).await
}

async fn handle_join(base_url: &str, args: JoinArgs) -> Result<(), CliError> {
    let (session_id, inferred_base) = interpret_session_target(&args.target)?;
    let base = inferred_base.unwrap_or_else(|| base_url.to_string());
    let config = CallConfig::new(&base)?;
    println!("\n🎬 Joining interview session {session_id} as {}", args.role);
    run_call(config, session_id, args.role, args.media.constraints()).await
}

async fn run_call(
    config: CallConfig,
    session_id: String,
    role: ParticipantRole,
    constraints: MediaConstraints,
) -> Result<(), CliError> {
    let connector = Arc::new(RtcConnector::new());
    let devices = SyntheticDevices::default();
    let (session, mut events) =
        CallSession::join(config, session_id, role, connector, &devices, constraints).await?;
    info!(
        session = %session.session_id(),
        role = %session.role(),
        media = %session.media_profile(),
        "call session started"
    );
    println!("  media profile : {}", session.media_profile());
    println!("\nWaiting for the call... (m mute, v camera, p presence, q quit)\n");

    let mut input = spawn_stdin_reader();
    let mut presence = session.presence_changes();
    let mut presence_live = true;
    let mut peer_online = presence.borrow().peer_online;
    let mut audio_on = true;
    let mut video_on = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(CallEvent::StateChanged(state)) => {
                    println!("• connection {state}");
                    if state == ConnectionState::Closed {
                        break;
                    }
                }
                Some(CallEvent::RemoteTrack(track)) => {
                    println!("• remote {} track {} (stream {})", track.kind, track.track_id, track.stream_id);
                }
                Some(CallEvent::RetryScheduled { attempt, delay }) => {
                    println!("• connection lost; retry {attempt} in {}s", delay.as_secs());
                }
                Some(CallEvent::RetriesExhausted) => {
                    println!("• giving up after repeated connection failures");
                    break;
                }
                Some(CallEvent::PeerLeft) => {
                    println!("• the other participant left");
                    break;
                }
                None => break,
            },
            line = input.recv() => match line.as_deref() {
                Some("m") => {
                    audio_on = !audio_on;
                    session.set_audio_enabled(audio_on);
                    println!("• microphone {}", if audio_on { "on" } else { "muted" });
                }
                Some("v") => {
                    video_on = !video_on;
                    session.set_video_enabled(video_on);
                    println!("• camera {}", if video_on { "on" } else { "off" });
                }
                Some("p") => {
                    let snapshot = session.presence();
                    println!(
                        "• {} looks {}",
                        snapshot.peer_role,
                        if snapshot.peer_online { "online" } else { "offline" }
                    );
                }
                Some("q") | None => break,
                Some("") => {}
                Some(other) => println!("• unknown command '{other}'"),
            },
            changed = presence.changed(), if presence_live => match changed {
                Ok(()) => {
                    let snapshot = presence.borrow().clone();
                    if snapshot.peer_online != peer_online {
                        peer_online = snapshot.peer_online;
                        println!(
                            "• {} went {}",
                            snapshot.peer_role,
                            if peer_online { "online" } else { "offline" }
                        );
                    }
                }
                Err(_) => presence_live = false,
            },
        }
    }

    session.leave().await;
    println!("\n✅ call ended");
    Ok(())
}

/// Forwards stdin lines into the async world. The thread parks on stdin,
/// so it only exits with the process; that is fine for a CLI.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line.trim().to_string()).is_err() {
                break;
            }
        }
    });
    rx
}

fn interpret_session_target(target: &str) -> Result<(String, Option<String>), CliError> {
    if let Ok(id) = Uuid::parse_str(target) {
        return Ok((id.to_string(), None));
    }

    let url = Url::parse(target).map_err(|_| CliError::InvalidSessionTarget {
        target: target.to_string(),
    })?;

    let session_id = session_id_from_url(&url).ok_or(CliError::InvalidSessionTarget {
        target: target.to_string(),
    })?;

    Ok((session_id, base_from_url(&url)))
}

fn session_id_from_url(url: &Url) -> Option<String> {
    let mut segments: Vec<_> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_else(Vec::new);
    if segments.is_empty() {
        return None;
    }

    if segments.last().map(|s| *s == "join").unwrap_or(false) {
        segments.pop();
    }
    let id = segments.pop()?;
    let candidate = id.to_string();
    Uuid::parse_str(&candidate).ok()?;
    Some(candidate)
}

fn base_from_url(url: &Url) -> Option<String> {
    let mut segments: Vec<String> = url
        .path_segments()
        .map(|s| {
            s.filter(|segment| !segment.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    if segments.is_empty() {
        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.set_path("/");
        return Some(base.to_string());
    }

    if segments.last().map(|s| s == "join").unwrap_or(false) {
        segments.pop();
    }
    if !segments.is_empty() {
        segments.pop();
    }
    if segments.last().map(|s| s == "sessions").unwrap_or(false) {
        segments.pop();
    }

    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);
    if segments.is_empty() {
        base.set_path("/");
    } else {
        let mut path = String::new();
        for segment in &segments {
            path.push('/');
            path.push_str(segment);
        }
        path.push('/');
        base.set_path(&path);
    }
    Some(base.to_string())
}

fn print_start_banner(session_id: &str, base: &str, role: ParticipantRole) {
    println!("\n🎬 greenroom session ready!\n");
    println!("  session id : {session_id}");
    println!("  your role  : {role}");
    println!("  relay      : {base}");
    println!("\n  invite command:\n    greenroom --relay-server {base} join {session_id}\n");
}
