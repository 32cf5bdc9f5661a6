use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::time::timeout;

use greenroom::call::{CallConfig, CallEvent, CallSession};
use greenroom::media::{MediaConstraints, MediaProfile, SyntheticDevices, TrackKind};
use greenroom::relay::ParticipantRole;
use greenroom::transport::ConnectionState;
use greenroom::transport::webrtc::linked_rtc_connectors;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct StubSession {
    next_seq: u64,
    signals: Vec<(u64, Value)>,
    presence: HashMap<String, Instant>,
}

type StubState = Arc<AsyncMutex<HashMap<String, StubSession>>>;

#[derive(Deserialize)]
struct AfterQuery {
    #[serde(default)]
    after: u64,
}

#[derive(Deserialize)]
struct RoleQuery {
    role: String,
}

async fn post_signal(
    State(state): State<StubState>,
    Path(session_id): Path<String>,
    Json(message): Json<Value>,
) -> StatusCode {
    let mut sessions = state.lock().await;
    let session = sessions.entry(session_id).or_default();
    session.next_seq += 1;
    let seq = session.next_seq;
    session.signals.push((seq, message));
    StatusCode::NO_CONTENT
}

async fn get_signals(
    State(state): State<StubState>,
    Path(session_id): Path<String>,
    Query(query): Query<AfterQuery>,
) -> Json<Value> {
    let mut sessions = state.lock().await;
    let session = sessions.entry(session_id).or_default();
    let messages: Vec<Value> = session
        .signals
        .iter()
        .filter(|(seq, _)| *seq > query.after)
        .map(|(seq, message)| {
            let mut entry = message.clone();
            entry["seq"] = json!(seq);
            entry
        })
        .collect();
    Json(json!({ "messages": messages }))
}

async fn post_presence(
    State(state): State<StubState>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let role = body["role"].as_str().unwrap_or_default().to_string();
    let mut sessions = state.lock().await;
    let session = sessions.entry(session_id).or_default();
    session.presence.insert(role, Instant::now());
    StatusCode::NO_CONTENT
}

async fn get_presence(
    State(state): State<StubState>,
    Path(session_id): Path<String>,
    Query(query): Query<RoleQuery>,
) -> Json<Value> {
    let peer = match query.role.as_str() {
        "candidate" => "interviewer",
        _ => "candidate",
    };
    let mut sessions = state.lock().await;
    let session = sessions.entry(session_id).or_default();
    let peer_online = session
        .presence
        .get(peer)
        .map(|seen| seen.elapsed() < Duration::from_secs(10))
        .unwrap_or(false);
    Json(json!({
        "peer_online": peer_online,
        "my_role": query.role,
        "peer_role": peer,
    }))
}

async fn spawn_stub_relay() -> (String, oneshot::Sender<()>) {
    let state: StubState = Arc::new(AsyncMutex::new(HashMap::new()));
    let router = Router::new()
        .route(
            "/sessions/:session_id/signals",
            get(get_signals).post(post_signal),
        )
        .route(
            "/sessions/:session_id/presence",
            get(get_presence).post(post_presence),
        )
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    (format!("http://{addr}"), shutdown_tx)
}

/// Drains events until the side is connected and has seen both remote
/// track kinds.
async fn expect_connected_with_tracks(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    side: &str,
) -> Vec<TrackKind> {
    let mut kinds = Vec::new();
    let mut connected = false;
    timeout(CONNECT_TIMEOUT, async {
        while !connected || !kinds.contains(&TrackKind::Audio) || !kinds.contains(&TrackKind::Video)
        {
            match events.recv().await {
                Some(CallEvent::StateChanged(ConnectionState::Connected)) => connected = true,
                Some(CallEvent::RemoteTrack(track)) => {
                    if !kinds.contains(&track.kind) {
                        kinds.push(track.kind);
                    }
                }
                Some(_) => {}
                None => panic!("{side}: event stream ended during negotiation"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{side}: timed out waiting for connection and media"));
    kinds
}

#[tokio::test(flavor = "multi_thread")]
async fn full_call_over_linked_webrtc_stacks() {
    let (base, shutdown) = spawn_stub_relay().await;
    let (interviewer_connector, candidate_connector) =
        linked_rtc_connectors().await.expect("linked connectors");
    let devices = SyntheticDevices::default();
    let config = CallConfig::new(&base)
        .expect("valid config")
        .with_poll_interval(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_millis(200));

    let (interviewer, mut interviewer_events) = CallSession::join(
        config.clone(),
        "itw-rtc",
        ParticipantRole::Interviewer,
        Arc::new(interviewer_connector),
        &devices,
        MediaConstraints::default(),
    )
    .await
    .expect("interviewer joins");

    let (candidate, mut candidate_events) = CallSession::join(
        config,
        "itw-rtc",
        ParticipantRole::Candidate,
        Arc::new(candidate_connector),
        &devices,
        MediaConstraints::default(),
    )
    .await
    .expect("candidate joins");

    assert_eq!(interviewer.media_profile(), MediaProfile::AudioVideo);
    assert_eq!(candidate.media_profile(), MediaProfile::AudioVideo);

    let interviewer_tracks =
        expect_connected_with_tracks(&mut interviewer_events, "interviewer").await;
    let candidate_tracks = expect_connected_with_tracks(&mut candidate_events, "candidate").await;
    assert_eq!(interviewer_tracks.len(), 2);
    assert_eq!(candidate_tracks.len(), 2);
    assert_eq!(interviewer.connection_state(), ConnectionState::Connected);
    assert_eq!(candidate.connection_state(), ConnectionState::Connected);

    // Hanging up on one side must close the other via the relay.
    candidate.leave().await;
    timeout(EVENT_TIMEOUT, async {
        loop {
            match interviewer_events.recv().await {
                Some(CallEvent::PeerLeft) => break,
                Some(_) => {}
                None => panic!("interviewer event stream ended before peer departure"),
            }
        }
    })
    .await
    .expect("peer departure never surfaced");

    timeout(EVENT_TIMEOUT, async {
        loop {
            match interviewer_events.recv().await {
                Some(CallEvent::StateChanged(ConnectionState::Closed)) => break,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .expect("interviewer never reached closed");
    assert_eq!(interviewer.connection_state(), ConnectionState::Closed);

    interviewer.leave().await;
    shutdown.send(()).ok();
}
