use crate::pull::{PullConsumer, PullStream};
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Access units buffered per client before frames are skipped
const STREAM_QUEUE_DEPTH: usize = 16;

/// Hands delivered frames to the response body
struct ChannelConsumer {
    tx: mpsc::Sender<Bytes>,
}

impl PullConsumer for ChannelConsumer {
    fn is_awaiting_data(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() > 0
    }

    fn frame_ready(&self, payload: Bytes, _truncated_bytes: usize) {
        if self.tx.try_send(payload).is_err() {
            tracing::trace!("Stream client not keeping up, frame dropped");
        }
    }
}

/// `GET /video.h264`: the camera as a raw Annex-B byte stream.
///
/// The stream is registered for as long as the response body is alive.
pub async fn video(State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    let stream = PullStream::new(
        state.pulls.clone(),
        Arc::new(ChannelConsumer { tx }),
        state.config.stream_max_payload,
    );
    stream.start();
    tracing::info!(key = ?stream.key(), "Stream client connected");

    let body = futures_util::stream::unfold((rx, stream), |(mut rx, stream)| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<_, Infallible>(chunk), (rx, stream)))
    });

    (
        [
            (header::CONTENT_TYPE, "video/h264"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
