use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{IceServerDescription, SdpType, SessionDescription};

/// Raw body of a signaling request.
///
/// Fields stay optional here so that a missing field can be reported with the
/// exact message the browser side expects instead of a generic parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Optional list of STUN/TURN URLs the caller would like to use.
    /// Anything other than an array is ignored, and so are non-string elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Value>,
}

/// A validated signaling request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<'a> {
    /// Ask the server to offer a stream
    Request,
    /// Complete a pending server offer
    Answer { id: &'a str, sdp: &'a str },
    /// Client-initiated offer
    Offer { sdp: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("missing 'type'")]
    MissingType,

    #[error("no sdp or id")]
    MissingSdpOrId,

    #[error("no sdp")]
    MissingSdp,

    #[error("Not expected: {0}")]
    Unexpected(String),
}

impl SignalRequest {
    pub fn request() -> Self {
        Self {
            kind: Some("request".to_string()),
            ..Default::default()
        }
    }

    pub fn answer(id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            kind: Some(SdpType::Answer.to_string()),
            id: Some(id.into()),
            sdp: Some(sdp.into()),
            ice_servers: None,
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some(SdpType::Offer.to_string()),
            sdp: Some(sdp.into()),
            ..Default::default()
        }
    }

    /// Validate the request and classify it by its `type` field
    pub fn signal(&self) -> Result<Signal<'_>, SignalError> {
        let kind = self.kind.as_deref().ok_or(SignalError::MissingType)?;

        match kind {
            "request" => Ok(Signal::Request),
            "answer" => match (self.id.as_deref(), self.sdp.as_deref()) {
                (Some(id), Some(sdp)) => Ok(Signal::Answer { id, sdp }),
                _ => Err(SignalError::MissingSdpOrId),
            },
            "offer" => match self.sdp.as_deref() {
                Some(sdp) => Ok(Signal::Offer { sdp }),
                None => Err(SignalError::MissingSdp),
            },
            other => Err(SignalError::Unexpected(other.to_string())),
        }
    }

    /// Elements of `ice_servers`, or nothing if the field is absent or not an array
    pub fn ice_server_hints(&self) -> &[Value] {
        match &self.ice_servers {
            Some(Value::Array(hints)) => hints,
            _ => &[],
        }
    }
}

/// Server offer returned for a `request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponse {
    pub id: String,
    #[serde(flatten)]
    pub description: SessionDescription,
    pub ice_servers: Vec<IceServerDescription>,
}

/// Server answer returned for a client `offer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    #[serde(flatten)]
    pub description: SessionDescription,
    pub ice_servers: Vec<IceServerDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> SignalRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_type() {
        let req = parse(json!({ "sdp": "v=0" }));
        assert_eq!(req.signal(), Err(SignalError::MissingType));
        assert_eq!(SignalError::MissingType.to_string(), "missing 'type'");
    }

    #[test]
    fn test_answer_requires_id_and_sdp() {
        let req = parse(json!({ "type": "answer", "id": "rtc-abc" }));
        assert_eq!(req.signal(), Err(SignalError::MissingSdpOrId));

        let req = parse(json!({ "type": "answer", "sdp": "v=0" }));
        assert_eq!(req.signal().unwrap_err().to_string(), "no sdp or id");

        let req = parse(json!({ "type": "answer", "id": "rtc-abc", "sdp": "v=0" }));
        assert_eq!(
            req.signal(),
            Ok(Signal::Answer {
                id: "rtc-abc",
                sdp: "v=0"
            })
        );
    }

    #[test]
    fn test_offer_requires_sdp() {
        let req = parse(json!({ "type": "offer" }));
        assert_eq!(req.signal(), Err(SignalError::MissingSdp));
    }

    #[test]
    fn test_unknown_type_is_echoed() {
        let req = parse(json!({ "type": "bogus" }));
        assert_eq!(req.signal().unwrap_err().to_string(), "Not expected: bogus");
    }

    #[test]
    fn test_ice_server_hints_ignore_non_arrays() {
        let req = parse(json!({ "type": "request", "ice_servers": "stun:example.org" }));
        assert!(req.ice_server_hints().is_empty());

        let req = parse(json!({ "type": "request", "ice_servers": ["stun:example.org", 5] }));
        assert_eq!(req.ice_server_hints().len(), 2);
    }

    #[test]
    fn test_offer_response_shape() {
        let response = OfferResponse {
            id: "rtc-abc".to_string(),
            description: SessionDescription::offer("v=0"),
            ice_servers: vec![],
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], "rtc-abc");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
        assert!(value["ice_servers"].is_array());
    }
}
