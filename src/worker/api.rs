//! Messages exchanged between the controller and the worker
//!
//! Requests carry platform objects (frame sources, track readers, offscreen
//! canvases) by value: sending a request moves them to the worker and the
//! controller cannot touch them afterwards.

use serde::Serialize;

use crate::event::WorkerEvent;
use crate::input::{
  DecoderBackendFactory, EncodedVideoSource, InputMetadata, InputVideoFrameSource, VideoTrackReader,
};
use crate::platform::OffscreenCanvas;
use crate::types::{InputId, OutputId, Resolution};

pub enum InputSource {
  /// Finite source decoded on the worker, buffered ahead of playback
  Decoded(Box<dyn InputVideoFrameSource>),
  /// Demuxed chunks decoded on the worker by a backend built there
  Encoded {
    source: Box<dyn EncodedVideoSource>,
    create_backend: DecoderBackendFactory,
  },
  /// Live video track, sampled at its latest frame
  Track(Box<dyn VideoTrackReader>),
}

pub struct RegisterInput {
  pub input_id: InputId,
  pub source: InputSource,
}

pub struct RegisterOutput {
  pub output_id: OutputId,
  pub resolution: Resolution,
  /// Initial scene, passed through to the renderer
  pub initial_scene: serde_json::Value,
  pub canvas: Box<dyn OffscreenCanvas>,
}

pub enum WorkerMessage {
  RegisterInput(RegisterInput),
  UnregisterInput { input_id: InputId },
  RegisterOutput(RegisterOutput),
  UnregisterOutput { output_id: OutputId },
  UpdateScene {
    output_id: OutputId,
    scene: serde_json::Value,
  },
  RegisterImage {
    image_id: String,
    spec: serde_json::Value,
  },
  UnregisterImage { image_id: String },
  RegisterFont { url: String },
  Start,
  Terminate,
}

impl WorkerMessage {
  pub fn name(&self) -> &'static str {
    match self {
      WorkerMessage::RegisterInput(_) => "registerInput",
      WorkerMessage::UnregisterInput { .. } => "unregisterInput",
      WorkerMessage::RegisterOutput(_) => "registerOutput",
      WorkerMessage::UnregisterOutput { .. } => "unregisterOutput",
      WorkerMessage::UpdateScene { .. } => "updateScene",
      WorkerMessage::RegisterImage { .. } => "registerImage",
      WorkerMessage::UnregisterImage { .. } => "unregisterImage",
      WorkerMessage::RegisterFont { .. } => "registerFont",
      WorkerMessage::Start => "start",
      WorkerMessage::Terminate => "terminate",
    }
  }
}

/// Response body. Void calls answer with no body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum WorkerResponse {
  RegisterInput(InputMetadata),
}

/// Request envelope with its correlation id
pub struct Request {
  pub id: u64,
  pub message: WorkerMessage,
}

/// Everything the worker posts back
#[derive(Debug, Clone, PartialEq)]
pub enum FromWorker {
  Response {
    id: u64,
    response: Option<WorkerResponse>,
    error: Option<String>,
  },
  Event(WorkerEvent),
}
