//! Local media capture.
//!
//! Capture degrades instead of failing: a session that cannot open a
//! camera falls back to audio, and a session with no usable devices still
//! joins and negotiates. Tracks are created once per session and survive
//! reconnects; each retry re-attaches the same track handles to the fresh
//! peer connection. Mute is a flag on the pump, nothing more.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);
const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);

// Opus DTX silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }
}

/// What capture actually produced, after degradation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaProfile {
    AudioVideo,
    AudioOnly,
    VideoOnly,
    None,
}

impl MediaProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaProfile::AudioVideo => "audio+video",
            MediaProfile::AudioOnly => "audio-only",
            MediaProfile::VideoOnly => "video-only",
            MediaProfile::None => "no media",
        }
    }
}

impl std::fmt::Display for MediaProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("{kind} capture unavailable: {reason}")]
    Unavailable { kind: TrackKind, reason: String },
    #[error("media source failed: {0}")]
    Source(String),
}

/// A running capture source feeding one track.
#[async_trait]
pub trait MediaSource: Send {
    fn kind(&self) -> TrackKind;

    fn start(&mut self) -> Result<(), MediaError>;

    async fn next_sample(&mut self) -> Result<Sample, MediaError>;

    fn stop(&mut self);
}

/// Opens capture sources per kind. Real device backends implement this;
/// [`SyntheticDevices`] is the built-in provider.
pub trait MediaDevices: Send + Sync {
    fn open_audio(&self) -> Result<Box<dyn MediaSource>, MediaError>;

    fn open_video(&self) -> Result<Box<dyn MediaSource>, MediaError>;
}

/// Generates placeholder samples on a fixed cadence. Used by the CLI and
/// by tests; peers see a live RTP stream without any OS device access.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticDevices {
    video_available: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            video_available: true,
        }
    }
}

impl SyntheticDevices {
    /// Provider for machines without a camera.
    pub fn without_video() -> Self {
        Self {
            video_available: false,
        }
    }
}

impl MediaDevices for SyntheticDevices {
    fn open_audio(&self) -> Result<Box<dyn MediaSource>, MediaError> {
        Ok(Box::new(SyntheticSource::audio()))
    }

    fn open_video(&self) -> Result<Box<dyn MediaSource>, MediaError> {
        if !self.video_available {
            return Err(MediaError::Unavailable {
                kind: TrackKind::Video,
                reason: "no synthetic camera configured".into(),
            });
        }
        Ok(Box::new(SyntheticSource::video()))
    }
}

pub struct SyntheticSource {
    kind: TrackKind,
    payload: Bytes,
    interval: Duration,
    ticker: Option<tokio::time::Interval>,
}

impl SyntheticSource {
    fn audio() -> Self {
        Self {
            kind: TrackKind::Audio,
            payload: Bytes::from_static(OPUS_SILENCE),
            interval: AUDIO_FRAME_INTERVAL,
            ticker: None,
        }
    }

    fn video() -> Self {
        // Keyframe-shaped prefix; nothing on the receiving side decodes it.
        let mut frame = vec![0u8; 64];
        frame[..6].copy_from_slice(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]);
        Self {
            kind: TrackKind::Video,
            payload: Bytes::from(frame),
            interval: VIDEO_FRAME_INTERVAL,
            ticker: None,
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn start(&mut self) -> Result<(), MediaError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        Ok(())
    }

    async fn next_sample(&mut self) -> Result<Sample, MediaError> {
        let Some(ticker) = self.ticker.as_mut() else {
            return Err(MediaError::Source("source not started".into()));
        };
        ticker.tick().await;
        Ok(Sample {
            data: self.payload.clone(),
            duration: self.interval,
            ..Default::default()
        })
    }

    fn stop(&mut self) {
        self.ticker = None;
    }
}

fn audio_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// A local track plus its mute flag. Cloning shares the underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        let (capability, id) = match kind {
            TrackKind::Audio => (audio_capability(), "greenroom-audio"),
            TrackKind::Video => (video_capability(), "greenroom-video"),
        };
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_owned(),
                "greenroom".to_owned(),
            )),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Handle for attaching to a peer connection.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

/// The session's local tracks and their capture pumps. Created once per
/// session; released exactly once via [`MediaTracks::stop`].
pub struct MediaTracks {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    profile: MediaProfile,
    pumps: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    stopped: bool,
}

impl MediaTracks {
    pub fn profile(&self) -> MediaProfile {
        self.profile
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn senders(&self) -> Vec<&LocalTrack> {
        self.audio.iter().chain(self.video.iter()).collect()
    }

    pub fn has_media(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }

    /// Flips the mute flag for one kind. Returns false when the session
    /// never acquired a track of that kind.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let track = match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        };
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Stops pumps and sources. The first call releases everything; later
    /// calls are no-ops.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        debug!(target: "media", profile = %self.profile, "releasing local capture");
        let _ = self.shutdown.send(true);
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
    }

    fn attach(&mut self, kind: TrackKind, source: Box<dyn MediaSource>) {
        let local = LocalTrack::new(kind);
        self.pumps.push(spawn_pump(
            source,
            local.rtp_track(),
            Arc::clone(&local.enabled),
            self.shutdown.subscribe(),
        ));
        match kind {
            TrackKind::Audio => self.audio = Some(local),
            TrackKind::Video => self.video = Some(local),
        }
    }
}

/// Opens capture per `constraints`, degrading on failure: camera trouble
/// drops to audio-only, microphone trouble drops to no media at all. This
/// never returns an error; the caller learns the outcome from the profile.
pub async fn acquire(devices: &dyn MediaDevices, constraints: MediaConstraints) -> MediaTracks {
    let (shutdown, _) = watch::channel(false);
    let mut tracks = MediaTracks {
        audio: None,
        video: None,
        profile: MediaProfile::None,
        pumps: Vec::new(),
        shutdown,
        stopped: false,
    };

    match (constraints.audio, constraints.video) {
        (true, true) => match (devices.open_audio(), devices.open_video()) {
            (Ok(audio), Ok(video)) => {
                tracks.attach(TrackKind::Audio, audio);
                tracks.attach(TrackKind::Video, video);
                tracks.profile = MediaProfile::AudioVideo;
            }
            (Ok(audio), Err(err)) => {
                warn!(target: "media", error = %err, "camera unavailable, continuing audio-only");
                tracks.attach(TrackKind::Audio, audio);
                tracks.profile = MediaProfile::AudioOnly;
            }
            (Err(err), _) => {
                warn!(target: "media", error = %err, "microphone unavailable, continuing without media");
            }
        },
        (true, false) => match devices.open_audio() {
            Ok(audio) => {
                tracks.attach(TrackKind::Audio, audio);
                tracks.profile = MediaProfile::AudioOnly;
            }
            Err(err) => {
                warn!(target: "media", error = %err, "microphone unavailable, continuing without media");
            }
        },
        (false, true) => match devices.open_video() {
            Ok(video) => {
                tracks.attach(TrackKind::Video, video);
                tracks.profile = MediaProfile::VideoOnly;
            }
            Err(err) => {
                warn!(target: "media", error = %err, "camera unavailable, continuing without media");
            }
        },
        (false, false) => {}
    }

    tracks
}

fn spawn_pump(
    mut source: Box<dyn MediaSource>,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = source.kind();
        if let Err(err) = source.start() {
            warn!(target: "media", kind = %kind, error = %err, "media source failed to start");
            return;
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                sample = source.next_sample() => {
                    match sample {
                        Ok(sample) => {
                            // Muted: drop the sample, keep the cadence.
                            if !enabled.load(Ordering::Relaxed) {
                                continue;
                            }
                            if let Err(err) = track.write_sample(&sample).await {
                                debug!(target: "media", kind = %kind, error = %err, "sample write failed");
                            }
                        }
                        Err(err) => {
                            warn!(target: "media", kind = %kind, error = %err, "media source ended");
                            break;
                        }
                    }
                }
            }
        }
        source.stop();
    })
}
