//! Connection negotiation between the two call participants.
//!
//! [`NegotiationEngine`] is a passive state machine fed one [`EngineEvent`]
//! at a time by the session driver. It owns the peer transport for the
//! current attempt, mirrors the signaling handshake, queues early ICE
//! candidates, and spends the retry budget when attempts fail.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call::CallEvent;
use crate::media::{MediaTracks, TrackKind};
use crate::relay::{ParticipantRole, RelayClient, SignalBody, SignalMessage};
use crate::transport::{
    CandidatePayload, ConnectionState, PeerConnector, PeerTransport, SdpPayload, TransportError,
    TransportEvent,
};

/// Input to [`NegotiationEngine::handle`].
#[derive(Debug)]
pub enum EngineEvent {
    /// A relayed message from the remote participant.
    Signal(SignalMessage),
    /// Something happened on the live peer transport.
    Transport(TransportEvent),
    /// The retry backoff deadline passed.
    BackoffElapsed,
}

/// Where the offer/answer exchange stands for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Counts connection restarts. One unit buys one fresh transport.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Claims one retry; returns false when none are left.
    pub fn consume(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    /// Restores the full budget once a connection is established.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

/// State machine for one participant's side of the call.
///
/// The interviewer always offers and the candidate always answers, so the
/// engine never has to break an offer collision. Failed attempts are retried
/// with a fixed backoff until the budget runs out; a successful connection
/// restores the budget.
pub struct NegotiationEngine {
    role: ParticipantRole,
    relay: RelayClient,
    connector: Arc<dyn PeerConnector>,
    tracks: MediaTracks,
    backoff: Duration,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<CallEvent>,
    signaling: SignalingState,
    offer_created: bool,
    offer_accepted: bool,
    pending_offer: Option<SdpPayload>,
    pending_candidates: Vec<CandidatePayload>,
    candidates_flushed: bool,
    remote_description_set: bool,
    budget: RetryBudget,
    transport: Option<Box<dyn PeerTransport>>,
    retry_at: Option<Instant>,
    torn_down: bool,
}

impl NegotiationEngine {
    pub fn new(
        role: ParticipantRole,
        relay: RelayClient,
        connector: Arc<dyn PeerConnector>,
        tracks: MediaTracks,
        backoff: Duration,
        max_retries: u32,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let engine = Self {
            role,
            relay,
            connector,
            tracks,
            backoff,
            state: ConnectionState::New,
            state_tx,
            events,
            signaling: SignalingState::Stable,
            offer_created: false,
            offer_accepted: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            candidates_flushed: false,
            remote_description_set: false,
            budget: RetryBudget::new(max_retries),
            transport: None,
            retry_at: None,
            torn_down: false,
        };
        (engine, state_rx)
    }

    /// Opens the first connection attempt and hands back its event stream.
    pub async fn start(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.begin_attempt().await
    }

    /// Feeds one event through the state machine. Returns a new transport
    /// event stream when a retry opened a fresh attempt.
    pub async fn handle(
        &mut self,
        event: EngineEvent,
    ) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        if self.torn_down {
            return None;
        }
        match event {
            EngineEvent::Signal(message) => {
                self.apply_signal(message).await;
                None
            }
            EngineEvent::Transport(event) => {
                self.apply_transport(event).await;
                None
            }
            EngineEvent::BackoffElapsed => self.resume_after_backoff().await,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Deadline for the pending retry, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn retries_used(&self) -> u32 {
        self.budget.used()
    }

    pub fn is_terminal(&self) -> bool {
        self.torn_down
    }

    /// Mutes or unmutes a local track. Purely local; no signal is posted.
    pub fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if !self.tracks.set_enabled(kind, enabled) {
            debug!(target: "negotiation", kind = %kind, "no local track to toggle");
        }
    }

    /// Shuts the engine down. Safe to call more than once; only the first
    /// call does anything. `notify_peer` posts a terminate signal so the
    /// other side stops negotiating instead of burning its retry budget.
    pub async fn teardown(&mut self, notify_peer: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if notify_peer {
            self.relay
                .post_signal(SignalBody::Terminate, self.role)
                .await;
        }
        self.release_transport().await;
        self.tracks.stop().await;
        self.retry_at = None;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.set_state(ConnectionState::Closed);
    }

    fn is_offerer(&self) -> bool {
        self.role == ParticipantRole::Interviewer
    }

    /// Tears down whatever attempt is live and opens a new one. Queued
    /// candidates survive; they belong to the next remote description.
    async fn begin_attempt(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.release_transport().await;
        self.signaling = SignalingState::Stable;
        self.offer_created = false;
        self.offer_accepted = false;
        self.candidates_flushed = false;
        self.remote_description_set = false;
        self.set_state(ConnectionState::New);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = self.connector.connect(&self.tracks, event_tx).await;
        match connected {
            Ok(transport) => {
                self.transport = Some(transport);
                if self.is_offerer() {
                    self.send_offer().await;
                } else if let Some(offer) = self.pending_offer.take() {
                    self.apply_remote_offer(offer).await;
                }
                Some(event_rx)
            }
            Err(err) => {
                warn!(target: "negotiation", error = %err, "peer transport setup failed");
                self.fail_attempt().await;
                None
            }
        }
    }

    /// Creates and posts the local offer. At most one per attempt.
    async fn send_offer(&mut self) {
        if self.offer_created {
            return;
        }
        let Some(transport) = self.transport.as_deref() else {
            return;
        };
        let result = describe_local(transport, Description::Offer).await;
        match result {
            Ok(offer) => {
                self.offer_created = true;
                self.signaling = SignalingState::HaveLocalOffer;
                self.relay
                    .post_signal(SignalBody::Offer(offer), self.role)
                    .await;
            }
            Err(err) => {
                warn!(target: "negotiation", error = %err, "creating offer failed");
                self.fail_attempt().await;
            }
        }
    }

    async fn apply_signal(&mut self, message: SignalMessage) {
        match message.body {
            SignalBody::Offer(offer) => self.apply_remote_offer(offer).await,
            SignalBody::Answer(answer) => self.apply_remote_answer(answer).await,
            SignalBody::IceCandidate(candidate) => self.apply_remote_candidate(candidate).await,
            SignalBody::Terminate => {
                info!(target: "negotiation", peer = %message.from_role, "peer left the session");
                let _ = self.events.send(CallEvent::PeerLeft);
                self.teardown(false).await;
            }
        }
    }

    /// First offer wins. Anything after it, or anything arriving while an
    /// exchange is already underway, is dropped.
    async fn apply_remote_offer(&mut self, offer: SdpPayload) {
        if self.offer_accepted || self.signaling != SignalingState::Stable {
            debug!(target: "negotiation", "ignoring renegotiation offer");
            return;
        }
        let Some(transport) = self.transport.as_deref() else {
            // Between attempts; keep the offer for the next transport.
            if self.pending_offer.is_none() {
                self.pending_offer = Some(offer);
            }
            return;
        };
        let applied = transport.set_remote_description(offer).await;
        if let Err(err) = applied {
            warn!(target: "negotiation", error = %err, "applying remote offer failed");
            self.fail_attempt().await;
            return;
        }
        self.signaling = SignalingState::HaveRemoteOffer;
        self.offer_accepted = true;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let Some(transport) = self.transport.as_deref() else {
            return;
        };
        let result = describe_local(transport, Description::Answer).await;
        match result {
            Ok(answer) => {
                self.signaling = SignalingState::Stable;
                self.relay
                    .post_signal(SignalBody::Answer(answer), self.role)
                    .await;
            }
            Err(err) => {
                warn!(target: "negotiation", error = %err, "creating answer failed");
                self.fail_attempt().await;
            }
        }
    }

    /// An answer only means something while our offer is outstanding.
    /// Replays and strays are discarded without touching the transport.
    async fn apply_remote_answer(&mut self, answer: SdpPayload) {
        if self.signaling != SignalingState::HaveLocalOffer {
            debug!(target: "negotiation", "discarding answer outside an offer exchange");
            return;
        }
        let Some(transport) = self.transport.as_deref() else {
            return;
        };
        let applied = transport.set_remote_description(answer).await;
        match applied {
            Ok(()) => {
                self.signaling = SignalingState::Stable;
                self.remote_description_set = true;
                self.flush_candidates().await;
            }
            Err(err) => {
                warn!(target: "negotiation", error = %err, "applying answer failed");
                self.fail_attempt().await;
            }
        }
    }

    /// Candidates that beat the remote description wait in a queue; the
    /// rest go straight to the transport. A rejected candidate is not an
    /// attempt failure, the pair may already be connected without it.
    async fn apply_remote_candidate(&mut self, candidate: CandidatePayload) {
        let transport = match self.transport.as_deref() {
            Some(transport) if self.remote_description_set => transport,
            _ => {
                self.pending_candidates.push(candidate);
                return;
            }
        };
        let applied = transport.add_ice_candidate(candidate).await;
        if let Err(err) = applied {
            debug!(target: "negotiation", error = %err, "remote candidate rejected");
        }
    }

    /// Drains the candidate queue into the transport, once per attempt.
    async fn flush_candidates(&mut self) {
        if self.candidates_flushed {
            return;
        }
        self.candidates_flushed = true;
        if self.pending_candidates.is_empty() {
            return;
        }
        let queued = mem::take(&mut self.pending_candidates);
        debug!(target: "negotiation", count = queued.len(), "flushing queued candidates");
        let Some(transport) = self.transport.as_deref() else {
            return;
        };
        for candidate in queued {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                debug!(target: "negotiation", error = %err, "queued candidate rejected");
            }
        }
    }

    async fn apply_transport(&mut self, event: TransportEvent) {
        if self.transport.is_none() {
            debug!(target: "negotiation", "dropping event from a released transport");
            return;
        }
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.relay
                    .post_signal(SignalBody::IceCandidate(candidate), self.role)
                    .await;
            }
            TransportEvent::RemoteTrack(track) => {
                info!(
                    target: "negotiation",
                    kind = %track.kind,
                    stream = %track.stream_id,
                    "remote media track arrived"
                );
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            TransportEvent::ConnectionState(state) => self.apply_connection_state(state).await,
        }
    }

    async fn apply_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.budget.reset();
                self.set_state(ConnectionState::Connected);
            }
            ConnectionState::Failed => self.fail_attempt().await,
            // Disconnected often recovers on its own; report it, do nothing.
            ConnectionState::Connecting | ConnectionState::Disconnected => self.set_state(state),
            ConnectionState::New | ConnectionState::Closed => {}
        }
    }

    /// Gives up on the current attempt. Schedules a retry while budget
    /// remains, otherwise closes the engine for good.
    async fn fail_attempt(&mut self) {
        if self.torn_down || self.retry_at.is_some() {
            return;
        }
        self.set_state(ConnectionState::Failed);
        self.release_transport().await;
        self.signaling = SignalingState::Stable;
        self.remote_description_set = false;

        if self.budget.exhausted() {
            warn!(
                target: "negotiation",
                retries = self.budget.used(),
                "connection failed with no retries left"
            );
            let _ = self.events.send(CallEvent::RetriesExhausted);
            self.teardown(false).await;
            return;
        }
        self.retry_at = Some(Instant::now() + self.backoff);
        info!(
            target: "negotiation",
            attempt = self.budget.used() + 1,
            delay_ms = self.backoff.as_millis() as u64,
            "scheduling connection retry"
        );
        let _ = self.events.send(CallEvent::RetryScheduled {
            attempt: self.budget.used() + 1,
            delay: self.backoff,
        });
    }

    async fn resume_after_backoff(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.retry_at.take()?;
        if !self.budget.consume() {
            return None;
        }
        info!(
            target: "negotiation",
            attempt = self.budget.used(),
            "restarting negotiation"
        );
        self.begin_attempt().await
    }

    async fn release_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                debug!(target: "negotiation", error = %err, "transport close reported an error");
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(target: "negotiation", from = %self.state, to = %next, "connection state changed");
        self.state = next;
        let _ = self.state_tx.send(next);
        let _ = self.events.send(CallEvent::StateChanged(next));
    }
}

enum Description {
    Offer,
    Answer,
}

/// Creates the local description and applies it before it leaves the
/// process, so candidate gathering starts immediately.
async fn describe_local(
    transport: &dyn PeerTransport,
    which: Description,
) -> Result<SdpPayload, TransportError> {
    let description = match which {
        Description::Offer => transport.create_offer().await?,
        Description::Answer => transport.create_answer().await?,
    };
    transport.set_local_description(description.clone()).await?;
    Ok(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{self, MediaConstraints, SyntheticDevices};
    use crate::relay::testing::{MockRelayBackend, mock_relay};
    use crate::transport::RemoteTrackInfo;
    use crate::transport::mock::{MockCall, MockConnector};

    const BACKOFF: Duration = Duration::from_millis(50);

    async fn engine_for(
        role: ParticipantRole,
        connector: Arc<MockConnector>,
        max_retries: u32,
        constraints: MediaConstraints,
    ) -> (
        NegotiationEngine,
        watch::Receiver<ConnectionState>,
        mpsc::UnboundedReceiver<CallEvent>,
        Arc<MockRelayBackend>,
    ) {
        let (relay, backend) = mock_relay("session-1");
        let tracks = media::acquire(&SyntheticDevices::default(), constraints).await;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (engine, state_rx) =
            NegotiationEngine::new(role, relay, connector, tracks, BACKOFF, max_retries, event_tx);
        (engine, state_rx, event_rx, backend)
    }

    async fn pump(
        engine: &mut NegotiationEngine,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Ok(event) = events.try_recv() {
            engine.handle(EngineEvent::Transport(event)).await;
        }
    }

    fn drained(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn posted(backend: &MockRelayBackend, kind: &str) -> usize {
        backend
            .stored()
            .iter()
            .filter(|message| message.body.kind() == kind)
            .count()
    }

    fn offer_message(sdp: &str) -> SignalMessage {
        SignalMessage {
            body: SignalBody::Offer(SdpPayload {
                sdp: sdp.to_string(),
                typ: "offer".to_string(),
            }),
            from_role: ParticipantRole::Interviewer,
        }
    }

    fn answer_message() -> SignalMessage {
        SignalMessage {
            body: SignalBody::Answer(SdpPayload {
                sdp: "v=0 remote answer".to_string(),
                typ: "answer".to_string(),
            }),
            from_role: ParticipantRole::Candidate,
        }
    }

    fn candidate_payload(marker: &str) -> CandidatePayload {
        CandidatePayload {
            candidate: marker.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn candidate_message(marker: &str) -> SignalMessage {
        SignalMessage {
            body: SignalBody::IceCandidate(candidate_payload(marker)),
            from_role: ParticipantRole::Interviewer,
        }
    }

    fn terminate_message() -> SignalMessage {
        SignalMessage {
            body: SignalBody::Terminate,
            from_role: ParticipantRole::Candidate,
        }
    }

    #[tokio::test]
    async fn offerer_posts_exactly_one_offer_per_attempt() {
        let connector = Arc::new(MockConnector::manual());
        let (mut engine, _state, _events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();

        let handle = connector.attempt(0).unwrap();
        let calls = handle.calls();
        assert!(matches!(calls[0], MockCall::CreateOffer));
        assert!(matches!(calls[1], MockCall::SetLocal(_)));
        assert_eq!(calls.len(), 2);
        assert_eq!(posted(&backend, "offer"), 1);
        assert_eq!(
            handle.local_description().map(|payload| payload.typ),
            Some("offer".to_string())
        );
    }

    #[tokio::test]
    async fn answerer_waits_for_the_offer_and_answers_once() {
        let connector = Arc::new(MockConnector::manual());
        let (mut engine, _state, _events, backend) = engine_for(
            ParticipantRole::Candidate,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        assert!(backend.stored().is_empty());

        engine
            .handle(EngineEvent::Signal(offer_message("v=0 first")))
            .await;
        let handle = connector.attempt(0).unwrap();
        assert_eq!(handle.set_remote_count(), 1);
        assert_eq!(posted(&backend, "answer"), 1);

        // A renegotiation offer must not disturb the settled exchange.
        engine
            .handle(EngineEvent::Signal(offer_message("v=0 second")))
            .await;
        assert_eq!(handle.set_remote_count(), 1);
        assert_eq!(posted(&backend, "answer"), 1);
        assert_eq!(
            handle.remote_description().map(|payload| payload.sdp),
            Some("v=0 first".to_string())
        );
    }

    #[tokio::test]
    async fn answer_outside_an_offer_exchange_never_touches_the_transport() {
        let connector = Arc::new(MockConnector::manual());
        let (mut engine, _state, _events, _backend) = engine_for(
            ParticipantRole::Candidate,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        engine.handle(EngineEvent::Signal(answer_message())).await;

        let handle = connector.attempt(0).unwrap();
        assert_eq!(handle.set_remote_count(), 0);
        assert_eq!(handle.remote_description(), None);
    }

    #[tokio::test]
    async fn early_candidates_queue_until_the_remote_description_lands() {
        let connector = Arc::new(MockConnector::manual());
        let (mut engine, _state, _events, _backend) = engine_for(
            ParticipantRole::Candidate,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        engine
            .handle(EngineEvent::Signal(candidate_message("cand-1")))
            .await;
        engine
            .handle(EngineEvent::Signal(candidate_message("cand-2")))
            .await;

        let handle = connector.attempt(0).unwrap();
        assert!(handle.candidates().is_empty());

        engine
            .handle(EngineEvent::Signal(offer_message("v=0 offer")))
            .await;
        let calls = handle.calls();
        assert!(matches!(calls[0], MockCall::SetRemote(_)));
        assert!(matches!(calls[1], MockCall::AddCandidate(_)));
        assert!(matches!(calls[2], MockCall::AddCandidate(_)));
        assert!(matches!(calls[3], MockCall::CreateAnswer));
        assert!(matches!(calls[4], MockCall::SetLocal(_)));
        assert_eq!(
            handle.candidates(),
            vec![candidate_payload("cand-1"), candidate_payload("cand-2")]
        );

        // Late candidates skip the queue now that the description is set.
        engine
            .handle(EngineEvent::Signal(candidate_message("cand-3")))
            .await;
        assert_eq!(handle.candidates().len(), 3);
    }

    #[tokio::test]
    async fn transport_events_reach_the_relay_and_the_caller() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, mut call_events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let mut rx = engine.start().await.unwrap();
        let handle = connector.attempt(0).unwrap();

        // Locally gathered candidates go out one by one, never batched.
        handle.emit_candidate(candidate_payload("local-1"));
        handle.emit_candidate(candidate_payload("local-2"));
        pump(&mut engine, &mut rx).await;
        assert_eq!(posted(&backend, "ice-candidate"), 2);

        handle.emit_remote_track(RemoteTrackInfo {
            kind: TrackKind::Audio,
            track_id: "mic".into(),
            stream_id: "peer".into(),
        });
        pump(&mut engine, &mut rx).await;
        let seen = drained(&mut call_events);
        assert!(seen.iter().any(|event| matches!(
            event,
            CallEvent::RemoteTrack(info) if info.kind == TrackKind::Audio
        )));
    }

    #[tokio::test]
    async fn failed_connection_retries_with_a_fresh_transport() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, mut call_events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let mut rx = engine.start().await.unwrap();
        engine.handle(EngineEvent::Signal(answer_message())).await;
        pump(&mut engine, &mut rx).await;
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
        assert_eq!(engine.retries_used(), 0);

        // A replayed answer after the exchange settled changes nothing.
        engine.handle(EngineEvent::Signal(answer_message())).await;
        assert_eq!(connector.attempt(0).unwrap().set_remote_count(), 1);

        connector
            .attempt(0)
            .unwrap()
            .emit_connection_state(ConnectionState::Failed);
        pump(&mut engine, &mut rx).await;
        assert_eq!(engine.connection_state(), ConnectionState::Failed);
        assert!(engine.retry_deadline().is_some());
        assert!(connector.attempt(0).unwrap().is_closed());
        assert!(drained(&mut call_events).contains(&CallEvent::RetryScheduled {
            attempt: 1,
            delay: BACKOFF,
        }));

        let mut rx = engine.handle(EngineEvent::BackoffElapsed).await.unwrap();
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(engine.retries_used(), 1);
        assert_eq!(posted(&backend, "offer"), 2);

        engine.handle(EngineEvent::Signal(answer_message())).await;
        pump(&mut engine, &mut rx).await;
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
        // Reconnecting restores the budget.
        assert_eq!(engine.retries_used(), 0);
    }

    #[tokio::test]
    async fn failed_transport_setup_schedules_a_retry() {
        let connector = Arc::new(MockConnector::auto_connecting());
        connector.fail_next_connect();
        let (mut engine, _state, _events, _backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        assert!(engine.start().await.is_none());
        assert_eq!(engine.connection_state(), ConnectionState::Failed);
        assert!(engine.retry_deadline().is_some());
        assert_eq!(connector.attempt_count(), 0);

        let rx = engine.handle(EngineEvent::BackoffElapsed).await;
        assert!(rx.is_some());
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(engine.retries_used(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_closes_without_a_new_transport() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, mut call_events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            0,
            MediaConstraints::disabled(),
        )
        .await;

        let mut rx = engine.start().await.unwrap();
        connector
            .attempt(0)
            .unwrap()
            .emit_connection_state(ConnectionState::Failed);
        pump(&mut engine, &mut rx).await;

        assert!(drained(&mut call_events).contains(&CallEvent::RetriesExhausted));
        assert_eq!(engine.connection_state(), ConnectionState::Closed);
        assert!(engine.is_terminal());
        assert!(engine.retry_deadline().is_none());
        assert_eq!(connector.attempt(0).unwrap().close_count(), 1);

        // No amount of prodding opens another transport.
        assert!(engine.handle(EngineEvent::BackoffElapsed).await.is_none());
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(posted(&backend, "terminate"), 0);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_notifies_once() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, _events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        engine.teardown(true).await;
        assert_eq!(posted(&backend, "terminate"), 1);
        assert_eq!(connector.attempt(0).unwrap().close_count(), 1);
        assert_eq!(engine.connection_state(), ConnectionState::Closed);

        engine.teardown(true).await;
        assert_eq!(posted(&backend, "terminate"), 1);
        assert_eq!(connector.attempt(0).unwrap().close_count(), 1);

        // Signals landing after close fall on the floor.
        engine
            .handle(EngineEvent::Signal(offer_message("v=0 late")))
            .await;
        assert_eq!(connector.attempt(0).unwrap().set_remote_count(), 0);
    }

    #[tokio::test]
    async fn peer_terminate_closes_without_retry_or_echo() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, mut call_events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::disabled(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        engine
            .handle(EngineEvent::Signal(terminate_message()))
            .await;

        assert!(drained(&mut call_events).contains(&CallEvent::PeerLeft));
        assert_eq!(engine.connection_state(), ConnectionState::Closed);
        assert!(engine.retry_deadline().is_none());
        assert_eq!(connector.attempt(0).unwrap().close_count(), 1);
        assert_eq!(posted(&backend, "terminate"), 0);
    }

    #[tokio::test]
    async fn muting_a_track_never_posts_signals() {
        let connector = Arc::new(MockConnector::auto_connecting());
        let (mut engine, _state, _events, backend) = engine_for(
            ParticipantRole::Interviewer,
            connector.clone(),
            5,
            MediaConstraints::audio_only(),
        )
        .await;

        let _rx = engine.start().await.unwrap();
        let before = backend.stored().len();

        engine.set_track_enabled(TrackKind::Audio, false);
        engine.set_track_enabled(TrackKind::Audio, true);
        engine.set_track_enabled(TrackKind::Video, false);
        assert_eq!(backend.stored().len(), before);

        engine.teardown(true).await;
    }
}
