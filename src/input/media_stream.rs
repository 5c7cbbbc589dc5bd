//! MediaStreamInput - live track input without lookahead
//!
//! Only the most recent frame is held. Ticks sample it without consuming it,
//! so a slow track repeats its last frame and a fast track drops frames that
//! arrived between two ticks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Input, InputMetadata};
use crate::config::PipelineOptions;
use crate::event::{EventSender, InputLifecycle, LifecycleTracker, WorkerEvent};
use crate::frame::{FrameRef, VideoFrameHandle};
use crate::types::{Frame, FrameFormat, InputId};

/// Reader over a live video track (`ReadableStream<VideoFrame>` on the web)
#[async_trait]
pub trait VideoTrackReader: Send {
  /// Next frame, or `None` once the track ended
  async fn read(&mut self) -> Option<Box<dyn VideoFrameHandle>>;

  fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStreamInputState {
  Started,
  Playing,
  Finished,
}

struct MediaStreamInputInner {
  frame: Option<FrameRef>,
  state: MediaStreamInputState,
  lifecycle: LifecycleTracker,
  closed: bool,
}

impl MediaStreamInputInner {
  fn replace_frame(&mut self, frame: Option<FrameRef>) {
    if let Some(previous) = std::mem::replace(&mut self.frame, frame) {
      previous.decrement_ref_count();
    }
  }
}

pub struct MediaStreamInput {
  input_id: InputId,
  inner: Arc<Mutex<MediaStreamInputInner>>,
  reader: Mutex<Option<Box<dyn VideoTrackReader>>>,
  stop: Mutex<Option<oneshot::Sender<()>>>,
  task: Mutex<Option<JoinHandle<()>>>,
  events: EventSender,
  format: FrameFormat,
}

impl MediaStreamInput {
  pub fn new(
    input_id: InputId,
    reader: Box<dyn VideoTrackReader>,
    events: EventSender,
    options: &PipelineOptions,
  ) -> Self {
    let format = if options.prefer_planar_frames {
      FrameFormat::YuvBytes
    } else {
      FrameFormat::RgbaBytes
    };
    Self {
      input_id,
      inner: Arc::new(Mutex::new(MediaStreamInputInner {
        frame: None,
        state: MediaStreamInputState::Started,
        lifecycle: LifecycleTracker::default(),
        closed: false,
      })),
      reader: Mutex::new(Some(reader)),
      stop: Mutex::new(None),
      task: Mutex::new(None),
      events,
      format,
    }
  }

  fn lock_inner(&self) -> MutexGuard<'_, MediaStreamInputInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> MediaStreamInputState {
    self.lock_inner().state
  }

  pub fn has_frame(&self) -> bool {
    self.lock_inner().frame.is_some()
  }
}

async fn read_track(
  input_id: InputId,
  mut reader: Box<dyn VideoTrackReader>,
  mut stop: oneshot::Receiver<()>,
  inner: Arc<Mutex<MediaStreamInputInner>>,
  events: EventSender,
  format: FrameFormat,
) {
  loop {
    let read = tokio::select! {
      handle = reader.read() => Some(handle),
      _ = &mut stop => None,
    };
    let Some(handle) = read else {
      reader.cancel();
      return;
    };

    let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
    match handle {
      Some(mut handle) if state.closed => handle.close(),
      Some(handle) => {
        let pts_ms = handle.timestamp_us() as f64 / 1000.0;
        state.replace_frame(Some(FrameRef::new(handle, pts_ms, format)));
      }
      None => {
        reader.cancel();
        state.replace_frame(None);
        state.state = MediaStreamInputState::Finished;
        tracing::debug!(target: "smelter", input_id = %input_id, "Track ended");
        // A track that ended before it was ever sampled still reports playing first
        for step in [InputLifecycle::Playing, InputLifecycle::Eos] {
          if state.lifecycle.advance(step) {
            events.send(WorkerEvent::video(&input_id, step));
          }
        }
        return;
      }
    }
  }
}

#[async_trait]
impl Input for MediaStreamInput {
  fn input_id(&self) -> &InputId {
    &self.input_id
  }

  fn start(&self) -> InputMetadata {
    let reader = self
      .reader
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();

    if let Some(reader) = reader {
      let (stop_tx, stop_rx) = oneshot::channel();
      let task = tokio::spawn(read_track(
        self.input_id.clone(),
        reader,
        stop_rx,
        self.inner.clone(),
        self.events.clone(),
        self.format,
      ));
      *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
      *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    } else {
      tracing::warn!(target: "smelter", input_id = %self.input_id, "Input already started");
    }

    let mut inner = self.lock_inner();
    if inner.lifecycle.advance(InputLifecycle::Delivered) {
      self
        .events
        .send(WorkerEvent::video(&self.input_id, InputLifecycle::Delivered));
    }
    // Live inputs have no known duration
    InputMetadata::default()
  }

  fn close(&self) {
    let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(stop) = stop {
      let _ = stop.send(());
    }
    let mut inner = self.lock_inner();
    inner.closed = true;
    inner.replace_frame(None);
  }

  fn update_queue_start_time(&self, _queue_start: Instant) {}

  async fn get_frame(&self, _current_queue_pts_ms: f64) -> Option<Frame> {
    let mut inner = self.lock_inner();
    let frame_ref = inner.frame.clone()?;
    let frame = match frame_ref.sample() {
      Ok(frame) => frame,
      Err(err) => {
        tracing::warn!(target: "smelter", input_id = %self.input_id, "Failed to read frame: {}", err);
        return None;
      }
    };

    if inner.state == MediaStreamInputState::Started {
      inner.state = MediaStreamInputState::Playing;
    }
    if inner.lifecycle.advance(InputLifecycle::Playing) {
      self
        .events
        .send(WorkerEvent::video(&self.input_id, InputLifecycle::Playing));
    }
    Some(frame)
  }
}

impl Drop for MediaStreamInput {
  fn drop(&mut self) {
    Input::close(self);
    if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
      task.abort();
    }
  }
}
