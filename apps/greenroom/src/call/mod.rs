//! Session-scoped call handle.
//!
//! [`CallSession::join`] wires the relay poller, the presence heartbeat,
//! local media capture, and the negotiation engine together, then drives
//! everything from a single task. The handle stays cheap to hold: state
//! and presence are mirrored through watch channels, noteworthy moments
//! arrive as [`CallEvent`]s, and commands travel the other way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use url::Url;

use crate::media::{self, MediaConstraints, MediaDevices, MediaProfile, TrackKind};
use crate::negotiation::{EngineEvent, NegotiationEngine};
use crate::presence::{PresenceClient, PresenceError, PresenceSnapshot, spawn_heartbeat};
use crate::relay::{ParticipantRole, RelayClient, RelayError, SignalPoller};
use crate::transport::{ConnectionState, PeerConnector, RemoteTrackInfo, TransportEvent};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

/// Where the signaling service lives and how eagerly we talk to it.
#[derive(Debug, Clone)]
pub struct CallConfig {
    base_url: Url,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    retry_backoff: Duration,
    max_retries: u32,
}

impl CallConfig {
    /// Normalizes a user-supplied relay address. Bare `host:port` gets an
    /// `http://` scheme and the path always ends in a slash so endpoint
    /// joins behave.
    pub fn new(raw: &str) -> Result<Self, CallError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CallError::InvalidConfig("relay url is empty".into()));
        }
        let mut normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized)
            .map_err(|err| CallError::InvalidConfig(format!("invalid relay url: {err}")))?;
        Ok(Self {
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Things a caller probably wants to surface in a UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    RemoteTrack(RemoteTrackInfo),
    /// A failed attempt will be retried after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// The retry budget ran dry; the session is over.
    RetriesExhausted,
    PeerLeft,
}

enum CallCommand {
    SetTrackEnabled { kind: TrackKind, enabled: bool },
    Leave { done: oneshot::Sender<()> },
}

/// A live interview call. Dropping the handle aborts the background
/// tasks; calling [`CallSession::leave`] first ends the call politely.
pub struct CallSession {
    session_id: String,
    role: ParticipantRole,
    media_profile: MediaProfile,
    commands: mpsc::UnboundedSender<CallCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    presence_rx: watch::Receiver<PresenceSnapshot>,
    driver: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    left: AtomicBool,
}

impl CallSession {
    /// Joins `session_id` in the given role and starts negotiating.
    ///
    /// Media capture degrades rather than fails: the session comes up
    /// with whatever tracks the devices yielded, down to none at all.
    pub async fn join(
        config: CallConfig,
        session_id: impl Into<String>,
        role: ParticipantRole,
        connector: Arc<dyn PeerConnector>,
        devices: &dyn MediaDevices,
        constraints: MediaConstraints,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let session_id = session_id.into();
        let relay = RelayClient::new(config.base_url.clone(), session_id.clone())?;
        let presence = PresenceClient::new(config.base_url.clone(), session_id.clone())?;

        let tracks = media::acquire(devices, constraints).await;
        let media_profile = tracks.profile();
        info!(
            target: "call",
            session = %session_id,
            role = %role,
            media = %media_profile,
            "joining session"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let poller = relay.poller(role);
        let (engine, state_rx) = NegotiationEngine::new(
            role,
            relay,
            connector,
            tracks,
            config.retry_backoff,
            config.max_retries,
            event_tx,
        );
        let (presence_rx, heartbeat) = spawn_heartbeat(presence, role, config.heartbeat_interval);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(engine, poller, command_rx, config.poll_interval));

        let session = Self {
            session_id,
            role,
            media_profile,
            commands: command_tx,
            state_rx,
            presence_rx,
            driver,
            heartbeat,
            left: AtomicBool::new(false),
        };
        Ok((session, event_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    /// The profile capture settled on when the session was joined.
    pub fn media_profile(&self) -> MediaProfile {
        self.media_profile
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel mirroring the connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Latest presence snapshot. Informational only; the call keeps
    /// negotiating whether or not the peer looks online.
    pub fn presence(&self) -> PresenceSnapshot {
        self.presence_rx.borrow().clone()
    }

    /// Watch channel mirroring the heartbeat's presence snapshots.
    pub fn presence_changes(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence_rx.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        let _ = self.commands.send(CallCommand::SetTrackEnabled {
            kind: TrackKind::Audio,
            enabled,
        });
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        let _ = self.commands.send(CallCommand::SetTrackEnabled {
            kind: TrackKind::Video,
            enabled,
        });
    }

    /// Ends the call: tells the peer, releases media and the transport,
    /// and stops the background tasks. Subsequent calls are no-ops.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(CallCommand::Leave { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        self.heartbeat.abort();
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.driver.abort();
    }
}

/// Single task that owns the engine. Polling, transport events, the
/// retry timer, and caller commands all funnel through one select loop,
/// so at most one signal poll is ever in flight.
async fn drive(
    mut engine: NegotiationEngine,
    mut poller: SignalPoller,
    mut commands: mpsc::UnboundedReceiver<CallCommand>,
    poll_interval: Duration,
) {
    let mut transport_rx = engine.start().await;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match poller.poll().await {
                    Ok(inbound) => {
                        for message in inbound {
                            engine.handle(EngineEvent::Signal(message)).await;
                        }
                    }
                    Err(err) => {
                        debug!(target: "call", error = %err, "signal poll failed; cursor kept");
                    }
                }
            }
            event = recv_transport(&mut transport_rx) => {
                engine.handle(EngineEvent::Transport(event)).await;
            }
            _ = retry_timer(engine.retry_deadline()) => {
                if let Some(rx) = engine.handle(EngineEvent::BackoffElapsed).await {
                    transport_rx = Some(rx);
                }
            }
            command = commands.recv() => match command {
                Some(CallCommand::SetTrackEnabled { kind, enabled }) => {
                    engine.set_track_enabled(kind, enabled);
                }
                Some(CallCommand::Leave { done }) => {
                    engine.teardown(true).await;
                    let _ = done.send(());
                    break;
                }
                // Handle dropped without leave; still say goodbye.
                None => {
                    engine.teardown(true).await;
                    break;
                }
            },
        }
        if engine.is_terminal() {
            break;
        }
    }
}

async fn recv_transport(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn retry_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_normalizes_bare_hosts() {
        let config = CallConfig::new("relay.example.com:4400").unwrap();
        assert_eq!(config.base_url().as_str(), "http://relay.example.com:4400/");
    }

    #[test]
    fn config_keeps_explicit_schemes_and_paths() {
        let config = CallConfig::new("https://relay.example.com/interviews").unwrap();
        assert_eq!(
            config.base_url().as_str(),
            "https://relay.example.com/interviews/"
        );
    }

    #[test]
    fn config_trims_whitespace() {
        let config = CallConfig::new("  127.0.0.1:4400  ").unwrap();
        assert_eq!(config.base_url().as_str(), "http://127.0.0.1:4400/");
    }

    #[test]
    fn config_rejects_empty_input() {
        assert!(matches!(
            CallConfig::new("   "),
            Err(CallError::InvalidConfig(_))
        ));
    }
}
