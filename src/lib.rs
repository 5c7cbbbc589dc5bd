#![deny(clippy::all)]

//! Soft real-time media pipeline for the browser build of a video compositor
//!
//! A worker owns a fixed-rate clock, buffered and live inputs, a renderer and
//! per-output sinks. The controller side owns the user visible objects
//! (canvases, media streams, WHIP sessions, audio mixing) and talks to the
//! worker through a correlated request/response bridge.

// Shared value types and configuration
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Platform seams (canvas, tracks, peer connection, audio graph)
pub mod platform;
pub mod renderer;

// Worker side pipeline
pub mod event;
pub mod frame;
pub mod input;
pub mod output;
pub mod queue;
pub mod worker;

// Controller side
pub mod audio;
pub mod bridge;
pub mod controller;

#[cfg(test)]
mod test_util;

pub use audio::{AudioDestination, AudioGraph, AudioMixConfig, AudioMixer, InputAudioConfig};
pub use bridge::AsyncWorker;
pub use config::PipelineOptions;
pub use controller::{OutputKind, RegisterInputRequest, RegisterOutputRequest, Smelter};
pub use error::{PipelineError, Result};
pub use event::{EventSender, WorkerEvent};
pub use frame::{FrameRef, VideoFrameHandle};
pub use input::{
  Decoder, DecoderBackendFactory, EncodedVideoSource, Input, InputMetadata, InputVideoFrameSource, MediaStreamInput,
  QueuedInput, VideoDecoderBackend, VideoTrackReader,
};
pub use output::{CanvasOutput, Output, StreamOutput, WhipOptions, WhipOutput};
pub use platform::{Canvas, MediaStream, MediaTrack, OffscreenCanvas, Platform, TrackHandle, TrackKind};
pub use queue::{FrameTicker, Queue};
pub use renderer::{AssetLoader, LoadedImage, Renderer, RendererError};
pub use types::{Frame, FrameFormat, Framerate, InputId, OutputId, Resolution};
pub use worker::{spawn_worker_thread, InputSource, Pipeline, WorkerMessage, WorkerResponse};
