//! Peer transport abstraction.
//!
//! The negotiation engine never talks to a platform RTC stack directly.
//! It drives a [`PeerTransport`] created by a [`PeerConnector`] and
//! receives platform callbacks as [`TransportEvent`]s on a channel, which
//! keeps every transition observable and lets tests swap in the in-memory
//! implementation from [`mock`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::media::{MediaTracks, TrackKind};

pub mod mock;
pub mod webrtc;

/// An SDP description as carried over the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub typ: String,
}

/// An ICE candidate as carried over the relay. Candidates are posted one
/// at a time, never batched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Connection lifecycle as reported by the platform transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
}

/// Platform callbacks, surfaced as plain values so the engine can treat
/// them as inputs to a transition function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    IceCandidate(CandidatePayload),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrackInfo),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport closed")]
    Closed,
}

/// One peer connection attempt. Descriptions and candidates go in through
/// these methods; everything coming back out arrives as [`TransportEvent`]s.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError>;

    async fn create_answer(&self) -> Result<SdpPayload, TransportError>;

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), TransportError>;

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    /// Releases the underlying connection. Safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for peer connection attempts. Each negotiation attempt gets a
/// fresh transport with the session's (reused) local tracks attached and
/// its callbacks wired to `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        tracks: &MediaTracks,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
