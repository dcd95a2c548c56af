//! Signaling protocol types for camstream
//!
//! Shared between the server and anything that talks to its `/webrtc` endpoint.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
