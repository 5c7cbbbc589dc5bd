//! Output sinks
//!
//! Worker side, every output is an [`Output`] that consumes one rendered
//! frame per tick (see [`canvas::CanvasOutput`]). Controller side, stream and
//! WHIP outputs capture that canvas and expose it as a `MediaStream`, with
//! the output's audio mix attached.

pub mod canvas;
pub mod stream;
pub mod whip;

use crate::types::{Frame, Resolution};

pub use canvas::CanvasOutput;
pub use stream::StreamOutput;
pub use whip::{WhipOptions, WhipOutput};

/// Terminal consumer of rendered frames, owned by the worker queue
pub trait Output: Send {
  fn resolution(&self) -> Resolution;

  /// Consume the frame rendered for this output on the current tick
  fn send_frame(&mut self, frame: Frame);

  fn close(&mut self) {}
}
