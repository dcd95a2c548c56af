//! Camstream Server Library
//!
//! Live H.264 camera delivery to browsers over WebRTC, plus a raw pull stream.
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod capture;
pub mod error;
pub mod gate;
pub mod pull;
pub mod state;
pub mod webrtc;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::thread::JoinHandle;

use capture::{run_pipe, PipeDevice};
use state::AppState;

/// Create and configure the server application
pub fn create_app(state: AppState) -> axum::Router {
    api::create_router(state)
}

/// Start the blocking reader for `H264_INPUT`, if configured
pub fn spawn_input(state: &AppState) -> Result<Option<JoinHandle<()>>> {
    let Some(input) = state.config.h264_input.clone() else {
        return Ok(None);
    };

    let source: Box<dyn Read + Send> = if input == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(File::open(&input).with_context(|| format!("failed to open {input}"))?)
    };

    let outputs = state.outputs();
    let handle = std::thread::Builder::new()
        .name("h264-input".to_string())
        .spawn(move || {
            let device = PipeDevice::new(input.clone());
            tracing::info!(input = %input, "Reading H.264 input");
            match run_pipe(source, &device, &outputs) {
                Ok(frames) => tracing::info!(input = %input, frames, "H.264 input ended"),
                Err(e) => tracing::error!(input = %input, "H.264 input failed: {}", e),
            }
        })
        .context("failed to start input thread")?;

    Ok(Some(handle))
}
