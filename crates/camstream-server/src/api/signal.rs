use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use camstream_protocol::{Signal, SignalRequest};
use serde_json::json;

/// `POST /webrtc`: one endpoint for all three signaling messages
pub async fn signal(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: SignalRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON: {e}")))?;

    match request.signal()? {
        Signal::Request => {
            let offer = state
                .negotiator
                .request(request.ice_server_hints())
                .await?;
            Ok(Json(offer).into_response())
        }
        Signal::Answer { id, sdp } => {
            state.negotiator.answer(id, sdp).await?;
            Ok(Json(json!({})).into_response())
        }
        Signal::Offer { sdp } => {
            let answer = state
                .negotiator
                .offer(sdp, request.ice_server_hints())
                .await?;
            Ok(Json(answer).into_response())
        }
    }
}
