//! Canvas sink: paints every rendered frame synchronously, no buffering

use super::Output;
use crate::platform::OffscreenCanvas;
use crate::types::{Frame, Resolution};

pub struct CanvasOutput {
  canvas: Box<dyn OffscreenCanvas>,
  resolution: Resolution,
  closed: bool,
}

impl CanvasOutput {
  pub fn new(canvas: Box<dyn OffscreenCanvas>, resolution: Resolution) -> Self {
    Self {
      canvas,
      resolution,
      closed: false,
    }
  }
}

impl Output for CanvasOutput {
  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn send_frame(&mut self, frame: Frame) {
    if frame.resolution != self.resolution {
      tracing::debug!(
        target: "smelter",
        expected = ?self.resolution,
        actual = ?frame.resolution,
        "Rendered frame does not match output resolution"
      );
    }
    if let Err(err) = self.canvas.paint(&frame) {
      tracing::warn!(target: "smelter", "Failed to paint frame: {}", err);
    }
  }

  fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    self.canvas.close();
  }
}

impl Drop for CanvasOutput {
  fn drop(&mut self) {
    self.close();
  }
}
