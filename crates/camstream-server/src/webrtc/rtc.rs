//! webrtc-rs backed transport
//!
//! Each connection carries one send-only H.264 track. Frames are queued from
//! the capture thread and written by a per-track task, so a slow peer only
//! ever drops its own frames.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use camstream_media::VideoCodec;
use camstream_protocol::{IceServerDescription, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::ice::IceServer;
use super::transport::{
    GatheringState, PeerConnection, PeerEvent, PeerEventHandler, PeerState, Transport, VideoTrack,
};

/// Payload type browsers commonly map to constrained baseline H.264
pub const DEFAULT_VIDEO_PAYLOAD_TYPE: u8 = 102;

// Profile Level ID: constrained baseline, level 3.1
// packetization-mode=1 enables FU-A fragmentation
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Frames queued per track before the oldest writer falls behind
const TRACK_QUEUE_DEPTH: usize = 32;

const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: VideoCodec::H264.mime_type().to_string(),
        clock_rate: VideoCodec::H264.clock_rate(),
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_string(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "pli".to_string(),
            },
        ],
    }
}

pub struct RtcTransport {
    api: API,
}

impl RtcTransport {
    pub fn new(payload_type: u8) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: h264_capability(),
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        // NACK responder and sender reports
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn connect(&self, ice_servers: Vec<IceServer>) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: vec![server.url()],
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        Ok(Arc::new(RtcPeerConnection {
            pc,
            ice_servers,
            handler: Mutex::new(None),
        }))
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    ice_servers: Vec<IceServer>,
    handler: Mutex<Option<PeerEventHandler>>,
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn gatherer_state(state: RTCIceGathererState) -> Option<GatheringState> {
    match state {
        RTCIceGathererState::New => Some(GatheringState::New),
        RTCIceGathererState::Gathering => Some(GatheringState::InProgress),
        RTCIceGathererState::Complete => Some(GatheringState::Complete),
        _ => None,
    }
}

fn session_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn state(&self) -> PeerState {
        peer_state(self.pc.connection_state()).unwrap_or(PeerState::New)
    }

    fn gathering_state(&self) -> GatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => GatheringState::InProgress,
            RTCIceGatheringState::Complete => GatheringState::Complete,
            _ => GatheringState::New,
        }
    }

    fn ice_servers(&self) -> Vec<IceServerDescription> {
        self.ice_servers.iter().map(IceServer::describe).collect()
    }

    fn on_event(&self, handler: PeerEventHandler) {
        *self.handler.lock() = Some(handler.clone());

        let h = handler.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let h = h.clone();
                Box::pin(async move {
                    if let Some(state) = peer_state(state) {
                        h(PeerEvent::StateChange(state)).await;
                    }
                })
            }));

        let h = handler.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                let h = h.clone();
                Box::pin(async move {
                    if let Some(state) = gatherer_state(state) {
                        h(PeerEvent::GatheringStateChange(state)).await;
                    }
                })
            }));

        let h = handler.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let h = h.clone();
                Box::pin(async move {
                    h(PeerEvent::SignalingStateChange(state.to_string())).await;
                })
            }));

        let h = handler;
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let h = h.clone();
                let id = track.id().to_string();
                Box::pin(async move {
                    h(PeerEvent::Track(id)).await;
                })
            }));
    }

    async fn add_video_track(&self) -> Result<Arc<dyn VideoTrack>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            "video".to_string(),
            "camstream".to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Read incoming RTCP so the NACK and report interceptors run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(Arc::new(RtcVideoTrack::spawn(track)))
    }

    async fn set_local_description(&self) -> Result<()> {
        let description = if self.pc.signaling_state() == RTCSignalingState::HaveRemoteOffer {
            self.pc.create_answer(None).await?
        } else {
            self.pc.create_offer(None).await?
        };

        self.pc.set_local_description(description.clone()).await?;

        let handler = self.handler.lock().clone();
        if let (Some(handler), Some(description)) = (handler, session_description(description)) {
            handler(PeerEvent::LocalDescription(description)).await;
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            SdpType::Rollback => bail!("rollback is not supported"),
        };

        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(session_description)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Writes queued access units to a sample track
pub struct RtcVideoTrack {
    tx: mpsc::Sender<Bytes>,
    streaming: AtomicBool,
    /// Time the previous sample was written; the next sample's duration is measured from it
    clock: Arc<Mutex<Option<Instant>>>,
}

impl RtcVideoTrack {
    fn spawn(track: Arc<TrackLocalStaticSample>) -> Self {
        let (tx, rx) = mpsc::channel(TRACK_QUEUE_DEPTH);
        let clock = Arc::new(Mutex::new(None));

        tokio::spawn(write_samples(track, rx, clock.clone()));

        Self {
            tx,
            streaming: AtomicBool::new(false),
            clock,
        }
    }
}

impl VideoTrack for RtcVideoTrack {
    fn is_open(&self) -> bool {
        self.streaming.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("track queue full, frame dropped"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("track closed"),
        })
    }

    fn start_streaming(&self) {
        *self.clock.lock() = Some(Instant::now());
        self.streaming.store(true, Ordering::Release);
    }
}

async fn write_samples(
    track: Arc<TrackLocalStaticSample>,
    mut rx: mpsc::Receiver<Bytes>,
    clock: Arc<Mutex<Option<Instant>>>,
) {
    while let Some(data) = rx.recv().await {
        let now = Instant::now();
        let duration = {
            let mut previous = clock.lock();
            let duration = previous
                .map(|t| now.saturating_duration_since(t))
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_FRAME_DURATION);
            *previous = Some(now);
            duration
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::warn!("Failed to write video sample: {}", e);
        }
    }
}
