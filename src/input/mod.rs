//! Inputs - buffer or sample decoded frames for the queue
//!
//! Two implementations share the [`Input`] contract:
//! - [`QueuedInput`] for finite, seekable sources (decoded files). A pull
//!   loop keeps a bounded FIFO of frames ahead of playback.
//! - [`MediaStreamInput`] for live tracks. Only the latest frame is held.

pub mod decoder;
pub mod media_stream;
pub mod queued;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::frame::VideoFrameHandle;
use crate::types::{Frame, InputId};

pub use decoder::{
  ChunkPoll, Decoder, DecoderBackendFactory, DecoderOutput, EncodedVideoChunk, EncodedVideoSource, VideoDecoderBackend,
};
pub use media_stream::{MediaStreamInput, VideoTrackReader};
pub use queued::QueuedInput;

/// Durations reported back to the caller on registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InputMetadata {
  pub video_duration_ms: Option<f64>,
  pub audio_duration_ms: Option<f64>,
}

/// Frame emitted by a source, with PTS on the source's own timeline
pub struct DecodedFrame {
  pub handle: Box<dyn VideoFrameHandle>,
  pub pts_ms: f64,
}

impl std::fmt::Debug for DecodedFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DecodedFrame")
      .field("pts_ms", &self.pts_ms)
      .finish()
  }
}

#[derive(Debug)]
pub enum SourcePoll {
  Frame(DecodedFrame),
  Eos,
}

/// Pull based source of decoded frames (demux and decode are hidden behind it)
pub trait InputVideoFrameSource: Send {
  fn metadata(&self) -> InputMetadata;

  /// Non-blocking. `None` means nothing is ready yet, poll again later.
  fn next_frame(&mut self) -> Option<SourcePoll>;

  fn close(&mut self) {}
}

#[async_trait]
pub trait Input: Send + Sync {
  fn input_id(&self) -> &InputId;

  /// Begin producing frames. Must be called inside a tokio runtime.
  fn start(&self) -> InputMetadata;

  /// Stop the background loop
  fn close(&self);

  /// Wall clock instant at which the queue produced PTS 0
  fn update_queue_start_time(&self, queue_start: Instant);

  /// Frame to show at `current_queue_pts_ms`, or `None` if nothing is buffered.
  ///
  /// The returned frame is a copy; the input keeps ownership of its refs.
  async fn get_frame(&self, current_queue_pts_ms: f64) -> Option<Frame>;
}

/// Signed difference `a - b` in milliseconds
pub(crate) fn instant_diff_ms(a: Instant, b: Instant) -> f64 {
  if a >= b {
    a.duration_since(b).as_secs_f64() * 1000.0
  } else {
    -(b.duration_since(a).as_secs_f64() * 1000.0)
  }
}
