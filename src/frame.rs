//! FrameRef - reference counted ownership of a decoded video frame
//!
//! A native decoded frame (a WebCodecs `VideoFrame` on the web) pins decoder
//! memory until it is closed, so its lifetime is tracked manually:
//!
//! - A `FrameRef` is created with a count of 1.
//! - `increment_ref_count` / `decrement_ref_count` adjust the count.
//! - The native handle is closed exactly once, on the 1 -> 0 transition.
//! - Any operation on a ref whose count already reached 0 is a bug in the
//!   caller and panics.
//!
//! Pixel data is materialized lazily by [`FrameRef::get_frame`] and memoized
//! while the ref is alive, because copying out of a native frame is far more
//! expensive than sampling the same frame on several ticks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{PipelineError, Result};
use crate::types::{Frame, FrameFormat, Resolution};

/// Native decoded frame owned by the platform (decoder output or live track)
pub trait VideoFrameHandle: Send {
  /// Native presentation timestamp in microseconds
  fn timestamp_us(&self) -> i64;

  fn resolution(&self) -> Resolution;

  /// Copy pixel data out of the native frame in the requested layout
  fn copy_to(&self, format: FrameFormat) -> Result<Vec<u8>>;

  /// Release the native resource
  fn close(&mut self);
}

struct FrameRefInner {
  handle: Option<Box<dyn VideoFrameHandle>>,
  ref_count: u32,
  frame: Option<Frame>,
}

impl Drop for FrameRefInner {
  fn drop(&mut self) {
    // Last clone dropped while references were still counted
    if let Some(mut handle) = self.handle.take() {
      tracing::warn!(
        target: "smelter",
        ref_count = self.ref_count,
        "FrameRef dropped without being released, closing native frame"
      );
      handle.close();
    }
  }
}

/// Reference counted handle to one decoded frame
///
/// Clones share the same count; cloning does not increment it.
#[derive(Clone)]
pub struct FrameRef {
  inner: Arc<Mutex<FrameRefInner>>,
  pts_ms: f64,
  format: FrameFormat,
  copyable: bool,
}

impl FrameRef {
  /// Wrap a native frame with a reference count of 1
  pub fn new(handle: Box<dyn VideoFrameHandle>, pts_ms: f64, format: FrameFormat) -> Self {
    Self::with_copyable(handle, pts_ms, format, true)
  }

  /// Variant for frames with at most one live consumer.
  ///
  /// `increment_ref_count` panics on such a ref.
  pub fn non_copyable(handle: Box<dyn VideoFrameHandle>, pts_ms: f64, format: FrameFormat) -> Self {
    Self::with_copyable(handle, pts_ms, format, false)
  }

  fn with_copyable(
    handle: Box<dyn VideoFrameHandle>,
    pts_ms: f64,
    format: FrameFormat,
    copyable: bool,
  ) -> Self {
    Self {
      inner: Arc::new(Mutex::new(FrameRefInner {
        handle: Some(handle),
        ref_count: 1,
        frame: None,
      })),
      pts_ms,
      format,
      copyable,
    }
  }

  fn lock(&self) -> MutexGuard<'_, FrameRefInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn pts_ms(&self) -> f64 {
    self.pts_ms
  }

  pub fn ref_count(&self) -> u32 {
    self.lock().ref_count
  }

  pub fn is_released(&self) -> bool {
    self.lock().handle.is_none()
  }

  pub fn increment_ref_count(&self) {
    if !self.copyable {
      panic!("FrameRef is not copyable, it can have only one consumer");
    }
    let mut inner = self.lock();
    assert!(
      inner.ref_count > 0,
      "FrameRef used after release (increment on ref_count 0)"
    );
    inner.ref_count += 1;
  }

  pub fn decrement_ref_count(&self) {
    let mut inner = self.lock();
    assert!(
      inner.ref_count > 0,
      "FrameRef used after release (decrement on ref_count 0)"
    );
    inner.ref_count -= 1;
    if inner.ref_count == 0 {
      inner.frame = None;
      if let Some(mut handle) = inner.handle.take() {
        handle.close();
      }
    }
  }

  /// Materialized pixel data, copied out of the native frame on first use
  pub fn get_frame(&self) -> Result<Frame> {
    let mut inner = self.lock();
    assert!(inner.ref_count > 0, "FrameRef used after release (get_frame)");
    if let Some(frame) = inner.frame.as_ref() {
      return Ok(frame.clone());
    }

    let handle = match inner.handle.as_ref() {
      Some(handle) => handle,
      None => unreachable!("ref_count > 0 implies a live handle"),
    };
    let resolution = handle.resolution();
    let data = handle.copy_to(self.format)?;
    let expected = self.format.byte_len(resolution);
    if data.len() != expected {
      return Err(PipelineError::Decoder(format!(
        "Copied {} bytes out of a {}x{} frame, expected {}",
        data.len(),
        resolution.width,
        resolution.height,
        expected
      )));
    }
    let frame = Frame {
      resolution,
      format: self.format,
      data: data.into(),
    };
    inner.frame = Some(frame.clone());
    Ok(frame)
  }

  /// Increment, copy out, decrement. The caller never holds the ref.
  pub fn sample(&self) -> Result<Frame> {
    self.increment_ref_count();
    let frame = self.get_frame();
    self.decrement_ref_count();
    frame
  }
}

impl std::fmt::Debug for FrameRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FrameRef")
      .field("pts_ms", &self.pts_ms)
      .field("ref_count", &self.ref_count())
      .field("copyable", &self.copyable)
      .finish()
  }
}
