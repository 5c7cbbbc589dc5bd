//! Decoder - turns an encoded chunk source into an `InputVideoFrameSource`
//!
//! Chunks are pulled from an [`EncodedVideoSource`] and handed to a platform
//! [`VideoDecoderBackend`] (WebCodecs `VideoDecoder` on the web). Decoded frames
//! come back through a crossbeam channel, mirroring the decoder output
//! callback.
//!
//! Memory is capped by a single bound: decoded-but-unconsumed frames plus the
//! backend's decode queue depth never exceed `max_decoded_frames`. Once the
//! bound is reached no more chunks are requested, however fast the source is.

use std::collections::VecDeque;

use crossbeam::channel::{self, Receiver, Sender};

use super::{DecodedFrame, InputMetadata, InputVideoFrameSource, SourcePoll};
use crate::config::PipelineOptions;
use crate::error::Result;
use crate::frame::VideoFrameHandle;

/// One demuxed access unit
#[derive(Debug, Clone)]
pub struct EncodedVideoChunk {
  pub data: Vec<u8>,
  /// Container timestamp in microseconds
  pub timestamp_us: i64,
  pub duration_us: Option<i64>,
  pub key: bool,
}

#[derive(Debug)]
pub enum ChunkPoll {
  Chunk(EncodedVideoChunk),
  Eos,
}

/// Demuxer side of the chain
pub trait EncodedVideoSource: Send {
  fn metadata(&self) -> InputMetadata;

  /// Non-blocking. `None` means no chunk is available yet.
  fn next_chunk(&mut self) -> Option<ChunkPoll>;

  fn close(&mut self) {}
}

/// Decoder output, delivered through the channel passed to the backend factory
pub enum DecoderOutput {
  Frame(Box<dyn VideoFrameHandle>),
  Error(String),
}

/// Platform video decoder
pub trait VideoDecoderBackend: Send {
  /// Queue a chunk for decoding. Frames are sent on the output channel.
  fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<()>;

  /// Chunks accepted but not yet decoded
  fn decode_queue_size(&self) -> usize;

  /// Emit every frame still held by the decoder
  fn flush(&mut self) -> Result<()>;

  fn close(&mut self);
}

/// Builds the backend on the worker, given the sender it must emit frames on
pub type DecoderBackendFactory = Box<dyn FnOnce(Sender<DecoderOutput>) -> Box<dyn VideoDecoderBackend> + Send>;

pub struct Decoder {
  source: Box<dyn EncodedVideoSource>,
  backend: Box<dyn VideoDecoderBackend>,
  output: Receiver<DecoderOutput>,
  decoded: VecDeque<Box<dyn VideoFrameHandle>>,
  max_decoded_frames: usize,
  /// Native timestamp of the first emitted frame
  first_timestamp_us: Option<i64>,
  source_eos: bool,
  flushed: bool,
  closed: bool,
}

impl Decoder {
  /// Build a decoder chain.
  ///
  /// `create_backend` receives the sender the backend must emit frames on.
  /// At most `options.max_decoded_frames` frames are in flight.
  pub fn new<F>(source: Box<dyn EncodedVideoSource>, options: &PipelineOptions, create_backend: F) -> Self
  where
    F: FnOnce(Sender<DecoderOutput>) -> Box<dyn VideoDecoderBackend>,
  {
    let (sender, receiver) = channel::unbounded();
    let backend = create_backend(sender);
    Self {
      source,
      backend,
      output: receiver,
      decoded: VecDeque::new(),
      max_decoded_frames: options.max_decoded_frames.max(1),
      first_timestamp_us: None,
      source_eos: false,
      flushed: false,
      closed: false,
    }
  }

  /// Frames currently held: decoded and waiting plus queued in the backend
  pub fn frames_in_flight(&self) -> usize {
    self.decoded.len() + self.output.len() + self.backend.decode_queue_size()
  }

  fn drain_output(&mut self) {
    while let Ok(output) = self.output.try_recv() {
      match output {
        DecoderOutput::Frame(handle) => self.decoded.push_back(handle),
        DecoderOutput::Error(message) => {
          // A single broken chunk only stalls this input
          tracing::warn!(target: "smelter", "Failed to decode video chunk: {}", message);
        }
      }
    }
  }

  fn enqueue_chunks(&mut self) {
    while !self.source_eos && self.frames_in_flight() < self.max_decoded_frames {
      match self.source.next_chunk() {
        Some(ChunkPoll::Chunk(chunk)) => {
          if let Err(err) = self.backend.decode(chunk) {
            tracing::warn!(target: "smelter", "Decoder rejected chunk: {}", err);
          }
        }
        Some(ChunkPoll::Eos) => {
          self.source_eos = true;
        }
        None => break,
      }
    }
  }

  fn pop_frame(&mut self) -> Option<SourcePoll> {
    let handle = self.decoded.pop_front()?;
    let timestamp_us = handle.timestamp_us();
    let first = *self.first_timestamp_us.get_or_insert(timestamp_us);
    let pts_ms = (timestamp_us - first) as f64 / 1000.0;
    Some(SourcePoll::Frame(DecodedFrame { handle, pts_ms }))
  }
}

impl InputVideoFrameSource for Decoder {
  fn metadata(&self) -> InputMetadata {
    self.source.metadata()
  }

  fn next_frame(&mut self) -> Option<SourcePoll> {
    if self.closed {
      return None;
    }
    self.drain_output();
    self.enqueue_chunks();
    self.drain_output();

    if let Some(frame) = self.pop_frame() {
      return Some(frame);
    }

    if !self.source_eos {
      return None;
    }

    if !self.flushed {
      self.flushed = true;
      if let Err(err) = self.backend.flush() {
        tracing::warn!(target: "smelter", "Decoder flush failed: {}", err);
      }
      self.drain_output();
      if let Some(frame) = self.pop_frame() {
        return Some(frame);
      }
    }

    if self.backend.decode_queue_size() == 0 && self.output.is_empty() {
      Some(SourcePoll::Eos)
    } else {
      None
    }
  }

  fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    self.backend.close();
    self.source.close();
    self.drain_output();
    for mut handle in self.decoded.drain(..) {
      handle.close();
    }
  }
}

impl Drop for Decoder {
  fn drop(&mut self) {
    InputVideoFrameSource::close(self);
  }
}
