//! Pipeline configuration
//!
//! All knobs have defaults matching the browser build, so an empty JSON
//! object deserializes into a working configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::types::Framerate;

/// Frames a `QueuedInput` keeps buffered before its pull loop pauses
pub const MAX_BUFFERED_FRAMES: usize = 10;
/// Period of the `QueuedInput` pull loop
pub const ENQUEUE_INTERVAL_MS: u64 = 50;
/// Decoded-but-unconsumed frames plus decoder queue depth
pub const MAX_DECODED_FRAMES: usize = 10;
/// Upper bound for non-trickle ICE gathering during WHIP negotiation
pub const ICE_GATHERING_TIMEOUT_MS: u64 = 2000;
/// Frames the clock may skip after a single overrun before re-anchoring
pub const MAX_FAST_FORWARD_FRAMES: u64 = 300;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
  pub framerate: Framerate,
  /// Forwarded to the renderer: how long a missing input keeps its last frame
  pub stream_fallback_timeout_ms: u64,
  pub max_buffered_frames: usize,
  pub enqueue_interval_ms: u64,
  pub max_decoded_frames: usize,
  pub ice_gathering_timeout_ms: u64,
  pub max_fast_forward_frames: u64,
  /// Materialize frames as planar YUV instead of packed RGBA
  pub prefer_planar_frames: bool,
  pub log_level: String,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      framerate: Framerate::default(),
      stream_fallback_timeout_ms: 500,
      max_buffered_frames: MAX_BUFFERED_FRAMES,
      enqueue_interval_ms: ENQUEUE_INTERVAL_MS,
      max_decoded_frames: MAX_DECODED_FRAMES,
      ice_gathering_timeout_ms: ICE_GATHERING_TIMEOUT_MS,
      max_fast_forward_frames: MAX_FAST_FORWARD_FRAMES,
      prefer_planar_frames: false,
      log_level: "warn".to_string(),
    }
  }
}

impl PipelineOptions {
  pub fn validate(&self) -> Result<()> {
    self.framerate.validate()
  }

  pub fn enqueue_interval(&self) -> Duration {
    Duration::from_millis(self.enqueue_interval_ms)
  }

  pub fn ice_gathering_timeout(&self) -> Duration {
    Duration::from_millis(self.ice_gathering_timeout_ms)
  }
}
