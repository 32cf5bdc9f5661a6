//! [`PeerConnector`] backed by the `webrtc` crate.
//!
//! Each negotiation attempt builds a fresh API instance and peer
//! connection, attaches the session's local tracks, and forwards the
//! platform callbacks into the attempt's event channel. ICE is trickled:
//! local candidates surface one at a time through
//! [`TransportEvent::IceCandidate`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::media::{MediaTracks, TrackKind};
use crate::transport::{
    CandidatePayload, ConnectionState, PeerConnector, PeerTransport, RemoteTrackInfo, SdpPayload,
    TransportError, TransportEvent,
};

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Production connector. [`linked_rtc_connectors`] builds a vnet-backed
/// pair of these so the full stack can be exercised without OS networking.
pub struct RtcConnector {
    ice_timeouts: (Duration, Duration, Duration),
    vnet: Option<Arc<Net>>,
}

impl RtcConnector {
    pub fn new() -> Self {
        Self {
            ice_timeouts: (
                Duration::from_secs(3),
                Duration::from_secs(10),
                Duration::from_millis(500),
            ),
            vnet: None,
        }
    }

    fn with_vnet(net: Arc<Net>) -> Self {
        Self {
            ice_timeouts: (
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_millis(200),
            ),
            vnet: Some(net),
        }
    }

    fn setting_engine(&self) -> SettingEngine {
        let mut setting = SettingEngine::default();
        let (disconnected, failed, keepalive) = self.ice_timeouts;
        setting.set_ice_timeouts(Some(disconnected), Some(failed), Some(keepalive));
        if let Some(net) = &self.vnet {
            setting.set_vnet(Some(Arc::clone(net)));
        }
        setting
    }
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        tracks: &MediaTracks,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let api = build_api(self.setting_engine())?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(to_setup_error)?,
        );

        for local in tracks.senders() {
            let track: Arc<dyn TrackLocal + Send + Sync> = local.rtp_track();
            pc.add_track(track).await.map_err(to_setup_error)?;
        }

        wire_callbacks(&pc, events);

        Ok(Box::new(RtcTransport {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate_events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let payload = CandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    };
                    let _ = candidate_events.send(TransportEvent::IceCandidate(payload));
                }
                Err(err) => {
                    warn!(target: "webrtc", error = %err, "local candidate serialization failed");
                }
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let state_events = state_events.clone();
        Box::pin(async move {
            let _ =
                state_events.send(TransportEvent::ConnectionState(connection_state_from(state)));
        })
    }));

    let track_events = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let track_events = track_events.clone();
            Box::pin(async move {
                let Some(kind) = track_kind_from(track.kind()) else {
                    debug!(target: "webrtc", "remote track with unspecified kind ignored");
                    return;
                };
                let info = RemoteTrackInfo {
                    kind,
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                };
                let _ = track_events.send(TransportEvent::RemoteTrack(info));
            })
        },
    ));
}

fn connection_state_from(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn track_kind_from(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(payload_from_description(&offer))
    }

    async fn create_answer(&self) -> Result<SdpPayload, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(payload_from_description(&answer))
    }

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), TransportError> {
        let description = description_from_payload(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), TransportError> {
        let description = description_from_payload(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state_from(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc.close().await.map_err(to_setup_error)
    }
}

fn payload_from_description(description: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        sdp: description.sdp.clone(),
        typ: description.sdp_type.to_string(),
    }
}

fn description_from_payload(payload: &SdpPayload) -> Result<RTCSessionDescription, TransportError> {
    let sdp = payload.sdp.clone();
    let description = match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(sdp),
        RTCSdpType::Answer => RTCSessionDescription::answer(sdp),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        other => {
            return Err(TransportError::Negotiation(format!(
                "unsupported sdp type {other}"
            )));
        }
    };
    description.map_err(to_negotiation_error)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard.add_net(nic_clone).await.map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}

/// Builds two connectors whose peer connections share a virtual router,
/// so negotiation and media flow run entirely in-process.
pub async fn linked_rtc_connectors() -> Result<(RtcConnector, RtcConnector), TransportError> {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(to_setup_error)?,
    ));

    let offer_vnet = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&offer_vnet, &wan).await?;

    let answer_vnet = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&answer_vnet, &wan).await?;

    {
        let mut router = wan.lock().await;
        router.start().await.map_err(to_setup_error)?;
    }

    Ok((
        RtcConnector::with_vnet(offer_vnet),
        RtcConnector::with_vnet(answer_vnet),
    ))
}
