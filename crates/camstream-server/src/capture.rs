//! Capture side of the pipeline
//!
//! The encoder thread asks [`FrameSink::needs_frame`] before doing any work and
//! hands each encoded access unit to [`FrameSink::on_frame`]. Frames are only
//! borrowed for the duration of that call.

use std::io::Read;
use std::sync::Arc;

use camstream_media::{AccessUnitReader, MediaError};

/// A device that can be asked to emit a key frame as soon as possible.
/// Best effort: there is no acknowledgement.
pub trait CaptureDevice: Send + Sync {
    fn force_key_frame(&self);
}

/// One encoded access unit
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    data: &'a [u8],
    key_frame: bool,
    device: &'a dyn CaptureDevice,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], key_frame: bool, device: &'a dyn CaptureDevice) -> Self {
        Self {
            data,
            key_frame,
            device,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_key_frame(&self) -> bool {
        self.key_frame
    }

    /// Device that produced this frame
    pub fn device(&self) -> &'a dyn CaptureDevice {
        self.device
    }
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("key_frame", &self.key_frame)
            .finish()
    }
}

/// A consumer of encoded frames
pub trait FrameSink: Send + Sync {
    /// Backpressure signal: false means the frame would be thrown away
    fn needs_frame(&self) -> bool;

    fn on_frame(&self, frame: &Frame<'_>);
}

/// Fans frames out to every registered sink
#[derive(Clone, Default)]
pub struct Outputs {
    sinks: Vec<Arc<dyn FrameSink>>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl FrameSink for Outputs {
    fn needs_frame(&self) -> bool {
        self.sinks.iter().any(|sink| sink.needs_frame())
    }

    fn on_frame(&self, frame: &Frame<'_>) {
        for sink in &self.sinks {
            if sink.needs_frame() {
                sink.on_frame(frame);
            }
        }
    }
}

/// Encoder output read from a pipe or file.
///
/// A pipe cannot be asked for a key frame; consumers wait for the encoder's
/// next scheduled IDR instead.
#[derive(Debug, Default)]
pub struct PipeDevice {
    name: String,
}

impl PipeDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl CaptureDevice for PipeDevice {
    fn force_key_frame(&self) {
        tracing::debug!(device = %self.name, "Key frame requested; waiting for the encoder's next IDR");
    }
}

/// Pump access units from `source` into `outputs` until the source ends.
///
/// Units are parsed regardless of demand so the stream stays aligned, but
/// nothing is dispatched while no sink needs a frame.
pub fn run_pipe<R: Read>(
    source: R,
    device: &dyn CaptureDevice,
    outputs: &dyn FrameSink,
) -> Result<u64, MediaError> {
    let mut dispatched = 0u64;

    for unit in AccessUnitReader::new(source) {
        let unit = unit?;
        if !outputs.needs_frame() {
            continue;
        }

        outputs.on_frame(&Frame::new(&unit.data, unit.key_frame, device));
        dispatched += 1;
    }

    Ok(dispatched)
}
