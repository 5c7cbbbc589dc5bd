//! Shared value types: identifiers, resolutions, framerates and frames

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

macro_rules! string_id {
  ($name:ident) => {
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct $name(pub String);

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
      }
    }

    impl From<&str> for $name {
      fn from(value: &str) -> Self {
        Self(value.to_string())
      }
    }

    impl From<String> for $name {
      fn from(value: String) -> Self {
        Self(value)
      }
    }
  };
}

string_id!(InputId);
string_id!(OutputId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

/// Output framerate as a rational number of frames per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
  pub num: u32,
  pub den: u32,
}

impl Default for Framerate {
  fn default() -> Self {
    Self { num: 30, den: 1 }
  }
}

impl Framerate {
  /// Both terms must be non zero
  pub fn validate(&self) -> Result<()> {
    if self.num == 0 || self.den == 0 {
      return Err(PipelineError::InvalidFramerate {
        num: self.num,
        den: self.den,
      });
    }
    Ok(())
  }

  /// `1000 * den / num`
  pub fn frame_duration_ms(&self) -> f64 {
    1000.0 * self.den as f64 / self.num as f64
  }

  pub fn frames_per_second(&self) -> f64 {
    self.num as f64 / self.den as f64
  }

  /// Exact offset of frame `index` from the clock origin.
  ///
  /// Computed in integer nanoseconds so that repeated scheduling never
  /// accumulates floating point drift.
  pub fn pts_offset(&self, index: u64) -> Duration {
    let nanos = index as u128 * 1_000_000_000u128 * self.den as u128 / self.num as u128;
    Duration::from_nanos(nanos as u64)
  }

  pub fn frame_duration(&self) -> Duration {
    self.pts_offset(1)
  }

  /// PTS in milliseconds of frame `index`
  pub fn pts_ms(&self, index: u64) -> f64 {
    index as f64 * self.frame_duration_ms()
  }
}

/// Pixel layout of materialized frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameFormat {
  /// Packed RGBA, 4 bytes per pixel
  RgbaBytes,
  /// Planar YUV 4:2:0 (I420)
  YuvBytes,
}

impl FrameFormat {
  /// Expected byte length of a frame with the given resolution
  pub fn byte_len(&self, resolution: Resolution) -> usize {
    let pixels = resolution.width as usize * resolution.height as usize;
    match self {
      FrameFormat::RgbaBytes => pixels * 4,
      FrameFormat::YuvBytes => {
        let chroma_w = (resolution.width as usize).div_ceil(2);
        let chroma_h = (resolution.height as usize).div_ceil(2);
        pixels + 2 * chroma_w * chroma_h
      }
    }
  }
}

/// Immutable decoded frame copied out of a native handle
///
/// Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
  pub resolution: Resolution,
  pub format: FrameFormat,
  pub data: Arc<[u8]>,
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Frame")
      .field("resolution", &self.resolution)
      .field("format", &self.format)
      .field("len", &self.data.len())
      .finish()
  }
}

/// Frames passed to the renderer for one tick
#[derive(Debug, Clone, Default)]
pub struct InputFrameSet {
  pub pts_ms: f64,
  pub frames: HashMap<InputId, Frame>,
}

/// Frames produced by the renderer for one tick
#[derive(Debug, Clone, Default)]
pub struct OutputFrameSet {
  pub pts_ms: f64,
  pub frames: HashMap<OutputId, Frame>,
}
