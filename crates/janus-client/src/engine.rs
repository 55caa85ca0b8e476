//! [`RtcEngine`] backed by the `webrtc` crate.
//!
//! Candidates are gathered before a local description is reported, so every
//! description handed to signaling is complete and trickle stays off.
//! Remote tracks are drained into a counting sink; nothing is decoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::EngineError;
use crate::rtc::{
    IceCandidate, MediaKind, RtcEngine, SdpKind, SessionDescription, TrackHandler, TrackInfo,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcEngineConfig {
    pub ice_servers: Vec<IceServer>,
    /// Add an outbound VP8 track before the first offer.
    pub send_video: bool,
    /// Add an outbound Opus track before the first offer.
    pub send_audio: bool,
    /// Stream id advertised for outbound tracks.
    pub stream_id: String,
}

impl Default for WebRtcEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            send_video: false,
            send_audio: false,
            stream_id: "janus-room".into(),
        }
    }
}

impl WebRtcEngineConfig {
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Publishing side: outbound video, optionally audio.
    pub fn sending(mut self, video: bool, audio: bool) -> Self {
        self.send_video = video;
        self.send_audio = audio;
        self
    }
}

type HandlerSlot = Arc<Mutex<Option<Arc<TrackHandler>>>>;

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    handler: HandlerSlot,
    received_packets: Arc<AtomicU64>,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl WebRtcEngine {
    pub async fn new(config: WebRtcEngineConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| EngineError::new("register_codecs", err))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| EngineError::new("register_interceptors", err))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|err| EngineError::new("new_peer_connection", err))?,
        );

        let mut engine = Self {
            pc,
            handler: Arc::new(Mutex::new(None)),
            received_packets: Arc::new(AtomicU64::new(0)),
            local_tracks: Vec::new(),
        };
        engine.install_track_listener();
        if config.send_video {
            engine
                .add_local_track(MIME_TYPE_VP8, 90_000, 0, "video", &config.stream_id)
                .await?;
        }
        if config.send_audio {
            engine
                .add_local_track(MIME_TYPE_OPUS, 48_000, 2, "audio", &config.stream_id)
                .await?;
        }
        Ok(engine)
    }

    /// RTP packets drained from remote tracks so far.
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Outbound tracks; callers with a media source write samples here.
    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.local_tracks
    }

    async fn add_local_track(
        &mut self,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        track_id: &str,
        stream_id: &str,
    ) -> Result<(), EngineError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            track_id.to_owned(),
            stream_id.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| EngineError::new("add_track", err))?;
        tokio::spawn(drain_rtcp(sender));
        debug!(target = "janus::engine", %mime_type, track_id, "local track added");
        self.local_tracks.push(track);
        Ok(())
    }

    // The peer connection gets exactly one listener; `on_track` only swaps
    // the handler it forwards to.
    fn install_track_listener(&self) {
        let handler = Arc::clone(&self.handler);
        let received = Arc::clone(&self.received_packets);
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let handler = handler.lock().clone();
                let received = Arc::clone(&received);
                Box::pin(async move {
                    let info = TrackInfo {
                        kind: media_kind(track.kind()),
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                    };
                    info!(
                        target = "janus::engine",
                        kind = ?info.kind,
                        track_id = %info.track_id,
                        "remote track arrived"
                    );
                    if let Some(handler) = handler {
                        (*handler)(info);
                    }
                    tokio::spawn(blackhole(track, received));
                })
            }));
    }

    async fn wait_for_gathering(&self) {
        let mut gathered = self.pc.gathering_complete_promise().await;
        trace!(target = "janus::engine", "waiting for ice gathering");
        let _ = gathered.recv().await;
        trace!(target = "janus::engine", "ice gathering complete");
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| EngineError::new("create_offer", err))?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::new("create_answer", err))?;
        from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(&description, "set_local_description")?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| EngineError::new("set_local_description", err))?;
        self.wait_for_gathering().await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(&description, "set_remote_description")?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::new("set_remote_description", err))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        match from_rtc(&description) {
            Ok(description) => Some(description),
            Err(err) => {
                warn!(target = "janus::engine", error = %err, "unusable local description");
                None
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| EngineError::new("add_ice_candidate", err))
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|err| EngineError::new("close", err))
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Unknown,
    }
}

fn to_rtc(
    description: &SessionDescription,
    operation: &'static str,
) -> Result<RTCSessionDescription, EngineError> {
    let sdp = description.sdp.clone();
    let description = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpKind::Rollback => {
            return Err(EngineError::new(operation, "rollback is not supported"));
        }
    };
    description.map_err(|err| EngineError::new(operation, err))
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::new(
                "local_description",
                "unspecified sdp type",
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

async fn blackhole(track: Arc<TrackRemote>, received: Arc<AtomicU64>) {
    let track_id = track.id();
    loop {
        match track.read_rtp().await {
            Ok(_) => {
                received.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(target = "janus::engine", %track_id, error = %err, "remote track ended");
                break;
            }
        }
    }
}

// Interceptors only run while RTCP is read off the sender.
async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; 1500];
    while sender.read(&mut buf).await.is_ok() {}
}
