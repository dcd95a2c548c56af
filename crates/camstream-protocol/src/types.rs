use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SDP description type, spelled the way browsers put it in `RTCSessionDescription.type`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sdp type: {0}")]
pub struct UnknownSdpType(pub String);

impl FromStr for SdpType {
    type Err = UnknownSdpType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            "pranswer" => Ok(SdpType::Pranswer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(UnknownSdpType(other.to_string())),
        }
    }
}

/// A session description exchanged during negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE server flavour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Transport used to reach a TURN relay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RelayType {
    #[default]
    TurnUdp,
    TurnTcp,
    TurnTls,
}

/// ICE server entry as reported back to the peer after negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerDescription {
    pub hostname: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub relay_type: RelayType,
}
