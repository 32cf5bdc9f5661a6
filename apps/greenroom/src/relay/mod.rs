//! HTTP signal relay client.
//!
//! Both participants of a session share one relay mailbox. Messages are
//! appended with a relay-assigned sequence number and fetched with an
//! `after` cursor, so delivery is at-least-once and unordered across
//! polls. Posting is fire-and-forget: the negotiation layer never learns
//! about a failed post and relies on retries at the protocol level instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::telemetry;
use crate::transport::{CandidatePayload, SdpPayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Candidate,
    Interviewer,
}

impl ParticipantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Candidate => "candidate",
            ParticipantRole::Interviewer => "interviewer",
        }
    }

    pub fn peer(self) -> Self {
        match self {
            ParticipantRole::Candidate => ParticipantRole::Interviewer,
            ParticipantRole::Interviewer => ParticipantRole::Candidate,
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload half of a signal, tagged by the `type` field on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer(SdpPayload),
    Answer(SdpPayload),
    IceCandidate(CandidatePayload),
    Terminate,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::IceCandidate(_) => "ice-candidate",
            SignalBody::Terminate => "terminate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(flatten)]
    pub body: SignalBody,
    pub from_role: ParticipantRole,
}

/// A signal as stored by the relay, with its mailbox sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSignal {
    pub seq: u64,
    #[serde(flatten)]
    pub message: SignalMessage,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignalBatch {
    #[serde(default)]
    messages: Vec<StoredSignal>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("relay returned status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid relay response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
trait RelayBackend: Send + Sync {
    async fn post_signal(
        &self,
        session_id: &str,
        message: &SignalMessage,
    ) -> Result<(), RelayError>;

    async fn fetch_signals(
        &self,
        session_id: &str,
        after: u64,
    ) -> Result<Vec<StoredSignal>, RelayError>;
}

struct ReqwestRelayBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestRelayBackend {
    fn new(base_url: Url) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    fn signals_url(&self, session_id: &str, after: Option<u64>) -> Result<Url, RelayError> {
        let mut url = self
            .base_url
            .join(&format!("sessions/{session_id}/signals"))
            .map_err(|err| RelayError::InvalidConfig(err.to_string()))?;
        if let Some(after) = after {
            url.query_pairs_mut()
                .append_pair("after", &after.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl RelayBackend for ReqwestRelayBackend {
    async fn post_signal(
        &self,
        session_id: &str,
        message: &SignalMessage,
    ) -> Result<(), RelayError> {
        let url = self.signals_url(session_id, None)?;
        let response = self.client.post(url).json(message).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn fetch_signals(
        &self,
        session_id: &str,
        after: u64,
    ) -> Result<Vec<StoredSignal>, RelayError> {
        let url = self.signals_url(session_id, Some(after))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::HttpStatus(status));
        }
        let batch: SignalBatch = response
            .json()
            .await
            .map_err(|err| RelayError::InvalidResponse(err.to_string()))?;
        Ok(batch.messages)
    }
}

/// Client half of the signal relay for one session.
#[derive(Clone)]
pub struct RelayClient {
    session_id: Arc<str>,
    backend: Arc<dyn RelayBackend>,
}

impl RelayClient {
    pub fn new(base_url: Url, session_id: impl Into<String>) -> Result<Self, RelayError> {
        let backend = ReqwestRelayBackend::new(base_url)?;
        Ok(Self {
            session_id: session_id.into().into(),
            backend: Arc::new(backend),
        })
    }

    #[cfg(test)]
    fn with_backend(session_id: impl Into<String>, backend: Arc<dyn RelayBackend>) -> Self {
        Self {
            session_id: session_id.into().into(),
            backend,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Posts a signal without surfacing failures. A lost signal is
    /// indistinguishable from relay loss, which the negotiation protocol
    /// already tolerates, so errors are logged and dropped here.
    pub async fn post_signal(&self, body: SignalBody, from_role: ParticipantRole) {
        let kind = body.kind();
        let message = SignalMessage { body, from_role };
        if let Err(err) = self.backend.post_signal(&self.session_id, &message).await {
            warn!(
                target: "relay",
                session_id = %self.session_id,
                signal = kind,
                error = %err,
                "signal post failed"
            );
        }
    }

    /// Creates the poller for this session. A session holds exactly one;
    /// `poll` takes `&mut self`, so there is never more than one fetch in
    /// flight per poller.
    pub fn poller(&self, role: ParticipantRole) -> SignalPoller {
        SignalPoller {
            client: self.clone(),
            role,
            cursor: 0,
        }
    }
}

pub struct SignalPoller {
    client: RelayClient,
    role: ParticipantRole,
    cursor: u64,
}

impl SignalPoller {
    /// Fetches everything after the cursor and returns the peer's messages.
    /// The cursor only advances on success, so a failed poll is retried in
    /// full on the next tick.
    pub async fn poll(&mut self) -> Result<Vec<SignalMessage>, RelayError> {
        let _guard = telemetry::PerfGuard::new("relay::poll");
        let stored = self
            .client
            .backend
            .fetch_signals(&self.client.session_id, self.cursor)
            .await?;
        let mut inbound = Vec::new();
        for signal in stored {
            if signal.seq > self.cursor {
                self.cursor = signal.seq;
            }
            // Both parties share the mailbox; skip our own signals.
            if signal.message.from_role == self.role {
                continue;
            }
            inbound.push(signal.message);
        }
        Ok(inbound)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::mock_relay;
    use serde_json::json;

    fn offer_from(role: ParticipantRole) -> SignalMessage {
        SignalMessage {
            body: SignalBody::Offer(SdpPayload {
                sdp: "v=0".into(),
                typ: "offer".into(),
            }),
            from_role: role,
        }
    }

    #[test]
    fn signal_wire_format_matches_relay_contract() {
        let message = SignalMessage {
            body: SignalBody::IceCandidate(CandidatePayload {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
            from_role: ParticipantRole::Candidate,
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "ice-candidate",
                "data": {
                    "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
                    "sdp_mid": "0",
                    "sdp_mline_index": 0,
                },
                "from_role": "candidate",
            })
        );

        let decoded: SignalMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn terminate_signal_has_no_payload() {
        let message = SignalMessage {
            body: SignalBody::Terminate,
            from_role: ParticipantRole::Interviewer,
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "terminate", "from_role": "interviewer" })
        );
    }

    #[tokio::test]
    async fn poller_skips_own_messages_and_advances_cursor() {
        let (client, backend) = mock_relay("session-1");
        backend.push(offer_from(ParticipantRole::Interviewer));
        backend.push(offer_from(ParticipantRole::Candidate));

        let mut poller = client.poller(ParticipantRole::Candidate);

        let inbound = poller.poll().await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].from_role, ParticipantRole::Interviewer);
        assert_eq!(poller.cursor(), 2);

        // Nothing new: the cursor keeps already-seen messages out.
        let inbound = poller.poll().await.unwrap();
        assert!(inbound.is_empty());

        backend.push(offer_from(ParticipantRole::Interviewer));
        let inbound = poller.poll().await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(poller.cursor(), 3);
    }

    #[tokio::test]
    async fn failed_poll_leaves_cursor_for_retry() {
        let (client, backend) = mock_relay("session-1");
        backend.push(offer_from(ParticipantRole::Interviewer));
        backend.set_fail_fetches(true);

        let mut poller = client.poller(ParticipantRole::Candidate);

        assert!(poller.poll().await.is_err());
        assert_eq!(poller.cursor(), 0);

        backend.set_fail_fetches(false);
        let inbound = poller.poll().await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(poller.cursor(), 1);
    }

    #[tokio::test]
    async fn post_signal_swallows_relay_failures() {
        let (client, backend) = mock_relay("session-1");
        backend.set_fail_posts(true);

        client
            .post_signal(SignalBody::Terminate, ParticipantRole::Candidate)
            .await;
        assert!(backend.stored().is_empty());
    }
}
