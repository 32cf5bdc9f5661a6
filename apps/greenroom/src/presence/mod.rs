//! Presence heartbeats.
//!
//! Presence is advisory: the heartbeat task keeps the service informed
//! that we are alive and mirrors the peer's status into a watch channel.
//! Nothing here gates negotiation; a stale snapshot is a display concern,
//! not a protocol one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use url::Url;

use crate::relay::ParticipantRole;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub peer_online: bool,
    pub my_role: ParticipantRole,
    pub peer_role: ParticipantRole,
}

impl PresenceSnapshot {
    /// Starting point before the first successful fetch.
    pub fn offline(role: ParticipantRole) -> Self {
        Self {
            peer_online: false,
            my_role: role,
            peer_role: role.peer(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RegisterRequest {
    role: ParticipantRole,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("invalid presence configuration: {0}")]
    InvalidConfig(String),
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("presence service returned status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid presence response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
trait PresenceBackend: Send + Sync {
    async fn register(
        &self,
        session_id: &str,
        role: ParticipantRole,
    ) -> Result<(), PresenceError>;

    async fn fetch(
        &self,
        session_id: &str,
        role: ParticipantRole,
    ) -> Result<PresenceSnapshot, PresenceError>;
}

struct ReqwestPresenceBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestPresenceBackend {
    fn new(base_url: Url) -> Result<Self, PresenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    fn presence_url(
        &self,
        session_id: &str,
        role: Option<ParticipantRole>,
    ) -> Result<Url, PresenceError> {
        let mut url = self
            .base_url
            .join(&format!("sessions/{session_id}/presence"))
            .map_err(|err| PresenceError::InvalidConfig(err.to_string()))?;
        if let Some(role) = role {
            url.query_pairs_mut().append_pair("role", role.as_str());
        }
        Ok(url)
    }
}

#[async_trait]
impl PresenceBackend for ReqwestPresenceBackend {
    async fn register(
        &self,
        session_id: &str,
        role: ParticipantRole,
    ) -> Result<(), PresenceError> {
        let url = self.presence_url(session_id, None)?;
        let response = self
            .client
            .post(url)
            .json(&RegisterRequest { role })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PresenceError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        session_id: &str,
        role: ParticipantRole,
    ) -> Result<PresenceSnapshot, PresenceError> {
        let url = self.presence_url(session_id, Some(role))?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PresenceError::HttpStatus(status));
        }
        response
            .json()
            .await
            .map_err(|err| PresenceError::InvalidResponse(err.to_string()))
    }
}

#[derive(Clone)]
pub struct PresenceClient {
    session_id: Arc<str>,
    backend: Arc<dyn PresenceBackend>,
}

impl PresenceClient {
    pub fn new(base_url: Url, session_id: impl Into<String>) -> Result<Self, PresenceError> {
        let backend = ReqwestPresenceBackend::new(base_url)?;
        Ok(Self {
            session_id: session_id.into().into(),
            backend: Arc::new(backend),
        })
    }

    #[cfg(test)]
    fn with_backend(session_id: impl Into<String>, backend: Arc<dyn PresenceBackend>) -> Self {
        Self {
            session_id: session_id.into().into(),
            backend,
        }
    }

    pub async fn register(&self, role: ParticipantRole) -> Result<(), PresenceError> {
        self.backend.register(&self.session_id, role).await
    }

    pub async fn check(&self, role: ParticipantRole) -> Result<PresenceSnapshot, PresenceError> {
        self.backend.fetch(&self.session_id, role).await
    }
}

/// Spawns the heartbeat loop: register, fetch, publish, repeat. Errors are
/// logged and the loop keeps going; the last good snapshot stays in the
/// watch channel until fresher data arrives.
pub fn spawn_heartbeat(
    client: PresenceClient,
    role: ParticipantRole,
    interval: Duration,
) -> (watch::Receiver<PresenceSnapshot>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(PresenceSnapshot::offline(role));
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = client.register(role).await {
                debug!(target: "presence", error = %err, "heartbeat post failed");
                continue;
            }
            match client.check(role).await {
                Ok(snapshot) => {
                    if tx.send(snapshot).is_err() {
                        break;
                    }
                }
                Err(err) => debug!(target: "presence", error = %err, "presence fetch failed"),
            }
        }
    });
    (rx, handle)
}
