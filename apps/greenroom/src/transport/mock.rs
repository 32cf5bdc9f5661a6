//! In-memory transport used by engine and lifecycle tests.
//!
//! Every operation is recorded, so tests can assert on exact call order.
//! In auto-connect mode a transport reports `connecting` then `connected`
//! as soon as both descriptions are in place, which lets scenario tests
//! drive a full handshake purely through signalling. Failures and other
//! platform events are injected through [`MockHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::MediaTracks;
use crate::transport::{
    CandidatePayload, ConnectionState, PeerConnector, PeerTransport, RemoteTrackInfo, SdpPayload,
    TransportError, TransportEvent,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpPayload),
    SetRemote(SdpPayload),
    AddCandidate(CandidatePayload),
    Close,
}

struct MockTransportState {
    label: usize,
    auto_connect: bool,
    calls: Mutex<Vec<MockCall>>,
    local_description: Mutex<Option<SdpPayload>>,
    remote_description: Mutex<Option<SdpPayload>>,
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl MockTransportState {
    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn transition(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events.send(TransportEvent::ConnectionState(state));
    }

    fn maybe_auto_connect(&self) {
        if !self.auto_connect || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let ready = self.local_description.lock().unwrap().is_some()
            && self.remote_description.lock().unwrap().is_some();
        if ready && *self.state.lock().unwrap() == ConnectionState::New {
            self.transition(ConnectionState::Connecting);
            self.transition(ConnectionState::Connected);
        }
    }
}

pub struct MockTransport {
    state: Arc<MockTransportState>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SdpPayload, TransportError> {
        self.state.ensure_open()?;
        self.state.record(MockCall::CreateOffer);
        Ok(SdpPayload {
            sdp: format!("v=0 mock attempt {}", self.state.label),
            typ: "offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SdpPayload, TransportError> {
        self.state.ensure_open()?;
        self.state.record(MockCall::CreateAnswer);
        Ok(SdpPayload {
            sdp: format!("v=0 mock attempt {}", self.state.label),
            typ: "answer".into(),
        })
    }

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        self.state.record(MockCall::SetLocal(description.clone()));
        *self.state.local_description.lock().unwrap() = Some(description);
        self.state.maybe_auto_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        self.state.record(MockCall::SetRemote(description.clone()));
        *self.state.remote_description.lock().unwrap() = Some(description);
        self.state.maybe_auto_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        self.state.record(MockCall::AddCandidate(candidate));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.state.lock().unwrap()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.record(MockCall::Close);
        self.state.transition(ConnectionState::Closed);
        Ok(())
    }
}

/// Test-side view of one transport attempt.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockTransportState>,
}

impl MockHandle {
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn local_description(&self) -> Option<SdpPayload> {
        self.state.local_description.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SdpPayload> {
        self.state.remote_description.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<CandidatePayload> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn set_remote_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::SetRemote(_)))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Close))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Injects a platform connection-state change.
    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.state.transition(state);
    }

    /// Injects a locally gathered candidate.
    pub fn emit_candidate(&self, candidate: CandidatePayload) {
        let _ = self
            .state
            .events
            .send(TransportEvent::IceCandidate(candidate));
    }

    /// Injects an incoming remote track.
    pub fn emit_remote_track(&self, info: RemoteTrackInfo) {
        let _ = self.state.events.send(TransportEvent::RemoteTrack(info));
    }
}

pub struct MockConnector {
    auto_connect: bool,
    fail_next: AtomicBool,
    attempts: Mutex<Vec<Arc<MockTransportState>>>,
}

impl MockConnector {
    /// Connector whose transports connect on their own once both
    /// descriptions are set.
    pub fn auto_connecting() -> Self {
        Self::new(true)
    }

    /// Connector whose transports only move when events are injected.
    pub fn manual() -> Self {
        Self::new(false)
    }

    fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            fail_next: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `connect` call fail once.
    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt(&self, index: usize) -> Option<MockHandle> {
        self.attempts
            .lock()
            .unwrap()
            .get(index)
            .map(|state| MockHandle {
                state: Arc::clone(state),
            })
    }

    pub fn last_attempt(&self) -> Option<MockHandle> {
        self.attempts
            .lock()
            .unwrap()
            .last()
            .map(|state| MockHandle {
                state: Arc::clone(state),
            })
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _tracks: &MediaTracks,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("mock connect failure".into()));
        }
        let mut attempts = self.attempts.lock().unwrap();
        let state = Arc::new(MockTransportState {
            label: attempts.len(),
            auto_connect: self.auto_connect,
            calls: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            state: Mutex::new(ConnectionState::New),
            events,
            closed: AtomicBool::new(false),
        });
        attempts.push(Arc::clone(&state));
        Ok(Box::new(MockTransport { state }))
    }
}
