//! WebRTC delivery: signaling, sessions and the engine binding

pub mod ice;
pub mod negotiation;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod transport;

pub use ice::{merge_ice_servers, IceServer, IceServerError};
pub use negotiation::{NegotiationError, Negotiator, NegotiatorConfig, DEFAULT_GATHER_TIMEOUT};
pub use registry::SessionRegistry;
pub use rtc::{RtcTransport, DEFAULT_VIDEO_PAYLOAD_TYPE};
pub use session::{ClientSession, NegotiationState, SessionId};
pub use transport::{
    GatheringState, PeerConnection, PeerEvent, PeerEventHandler, PeerState, Transport, VideoTrack,
};
