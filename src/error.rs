//! Pipeline error types
//!
//! Recoverable failures travel as `PipelineError`. Contract violations that
//! indicate a bug in the caller (reference count misuse on a released
//! `FrameRef`, ticking a clock that was never started) panic instead and are
//! never converted into this type.

use crate::renderer::RendererError;
use crate::types::{InputId, OutputId};

/// Pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("Input \"{0}\" already exists")]
  InputAlreadyRegistered(InputId),

  #[error("Output \"{0}\" already exists")]
  OutputAlreadyRegistered(OutputId),

  #[error("Unknown input \"{0}\"")]
  InputNotFound(InputId),

  #[error("Unknown output \"{0}\"")]
  OutputNotFound(OutputId),

  #[error("Compositor was already started")]
  AlreadyStarted,

  #[error("Invalid framerate {num}/{den}")]
  InvalidFramerate { num: u32, den: u32 },

  #[error("Renderer error: {0}")]
  Renderer(#[from] RendererError),

  #[error("Decoder error: {0}")]
  Decoder(String),

  #[error("WHIP request failed with status {status}: {message}")]
  Whip { status: u16, message: String },

  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("Invalid URL: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("Peer connection error: {0}")]
  PeerConnection(String),

  #[error("Failed to gather ICE candidates for offer")]
  IceGatheringFailed,

  /// Error raised inside the worker and serialized across the bridge
  #[error("{0}")]
  Worker(String),

  #[error("Worker terminated")]
  WorkerTerminated,

  #[error("Lock poisoned")]
  LockPoisoned,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Acquire a `std::sync::Mutex`, mapping poisoning to `PipelineError::LockPoisoned`.
macro_rules! lock {
  ($mutex:expr) => {
    $mutex
      .lock()
      .map_err(|_| $crate::error::PipelineError::LockPoisoned)?
  };
}

pub(crate) use lock;
