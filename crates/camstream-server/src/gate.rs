//! Key frame admission
//!
//! A consumer that joins mid-GOP cannot decode anything until the next key
//! frame, so frames are held back until one arrives. The first dropped frame
//! asks the capture device for a fresh key frame, once.

/// Outcome of offering a frame to a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward the frame
    Deliver,
    /// Discard the frame; `request_key_frame` is set the first time only
    Drop { request_key_frame: bool },
}

/// Per-consumer key frame state
#[derive(Debug, Clone, Default)]
pub struct KeyFrameGate {
    had_key_frame: bool,
    requested_key_frame: bool,
}

impl KeyFrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, is_key_frame: bool) -> Admission {
        if self.had_key_frame {
            return Admission::Deliver;
        }

        if is_key_frame {
            self.had_key_frame = true;
            return Admission::Deliver;
        }

        let request_key_frame = !self.requested_key_frame;
        self.requested_key_frame = true;
        Admission::Drop { request_key_frame }
    }

    /// Start a new "awaiting key frame" episode
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn had_key_frame(&self) -> bool {
        self.had_key_frame
    }

    pub fn requested_key_frame(&self) -> bool {
        self.requested_key_frame
    }
}
