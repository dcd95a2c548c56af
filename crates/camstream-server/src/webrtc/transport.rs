//! Seam between the session core and the WebRTC engine
//!
//! The engine owns ICE, DTLS and packetization. Sessions only need to drive
//! the offer/answer exchange, write encoded frames and hear about state
//! changes, which is what these traits expose.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use camstream_protocol::{IceServerDescription, SessionDescription};

use super::ice::IceServer;

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the connection never carries media again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// ICE candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    InProgress,
    Complete,
}

/// Asynchronous notifications from the engine
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChange(PeerState),
    GatheringStateChange(GatheringState),
    SignalingStateChange(String),
    LocalDescription(SessionDescription),
    Track(String),
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outgoing video track bound to one connection
pub trait VideoTrack: Send + Sync {
    /// True once the track can carry media
    fn is_open(&self) -> bool;

    /// Queue one encoded access unit. Must not block.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Anchor the media clock at the current time
    fn start_streaming(&self);
}

/// One negotiated connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn state(&self) -> PeerState;

    fn gathering_state(&self) -> GatheringState;

    /// ICE servers this connection was configured with
    fn ice_servers(&self) -> Vec<IceServerDescription>;

    /// Install the event handler; replaces any previous one
    fn on_event(&self, handler: PeerEventHandler);

    /// Add the single send-only H.264 track
    async fn add_video_track(&self) -> Result<Arc<dyn VideoTrack>>;

    /// Generate and apply a local description: an answer if a remote offer
    /// is pending, otherwise an offer. Starts candidate gathering.
    async fn set_local_description(&self) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Current local description, candidates included once gathering is complete
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, ice_servers: Vec<IceServer>) -> Result<Arc<dyn PeerConnection>>;
}
