//! Media utilities for camstream
//!
//! This crate provides the H.264 plumbing the server needs around an encoded
//! frame source:
//! - NAL unit iteration and key frame detection
//! - Splitting an Annex-B byte stream into access units

pub mod annexb;
pub mod codec;

pub use annexb::{AccessUnit, AccessUnitReader};
pub use codec::*;
