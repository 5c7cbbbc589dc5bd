//! QueuedInput - buffered input for finite sources
//!
//! A background pull loop, running on its own interval and unsynchronized with
//! queue ticks, keeps up to `max_buffered_frames` decoded frames ahead of
//! playback. Ticks sample whatever is buffered at the time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{instant_diff_ms, DecodedFrame, Input, InputMetadata, InputVideoFrameSource, SourcePoll};
use crate::config::PipelineOptions;
use crate::event::{EventSender, InputLifecycle, LifecycleTracker, WorkerEvent};
use crate::frame::FrameRef;
use crate::types::{Frame, FrameFormat, InputId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedInputState {
  WaitingForStart,
  Buffering,
  Playing,
  Finished,
}

struct QueuedInputInner {
  /// PTS of buffered frames start from 0 at the first frame
  frames: VecDeque<FrameRef>,
  /// Wall clock time the first frame was buffered
  first_frame_time: Option<Instant>,
  /// Source PTS of the first frame
  first_frame_pts_ms: Option<f64>,
  queue_start_time: Option<Instant>,
  received_eos: bool,
  state: QueuedInputState,
  lifecycle: LifecycleTracker,
}

impl QueuedInputInner {
  fn push_frame(&mut self, frame: DecodedFrame, format: FrameFormat) {
    if self.first_frame_time.is_none() {
      self.first_frame_time = Some(Instant::now());
    }
    let first_pts = *self.first_frame_pts_ms.get_or_insert(frame.pts_ms);
    self
      .frames
      .push_back(FrameRef::new(frame.handle, frame.pts_ms - first_pts, format));
  }

  fn queue_pts_to_input_pts(&self, queue_pts_ms: f64) -> f64 {
    // Fixed once both instants are known
    let offset_ms = match (self.first_frame_time, self.queue_start_time) {
      (Some(first_frame_time), Some(queue_start_time)) => {
        instant_diff_ms(first_frame_time, queue_start_time)
      }
      _ => 0.0,
    };
    queue_pts_ms - offset_ms
  }

  /// Find the frame closest to `input_pts_ms` and release every frame older than it
  fn drop_old_frames(&mut self, input_pts_ms: f64) {
    let target_pts = self
      .frames
      .iter()
      .map(FrameRef::pts_ms)
      .reduce(|prev, pts| {
        if (prev - input_pts_ms).abs() < (pts - input_pts_ms).abs() {
          prev
        } else {
          pts
        }
      });
    let Some(target_pts) = target_pts else {
      return;
    };

    while let Some(front) = self.frames.front() {
      if front.pts_ms() >= target_pts {
        break;
      }
      if let Some(frame_ref) = self.frames.pop_front() {
        frame_ref.decrement_ref_count();
      }
    }
  }

  fn release_frames(&mut self) {
    for frame_ref in self.frames.drain(..) {
      frame_ref.decrement_ref_count();
    }
  }
}

pub struct QueuedInput {
  input_id: InputId,
  inner: Arc<Mutex<QueuedInputInner>>,
  source: Arc<Mutex<Box<dyn InputVideoFrameSource>>>,
  events: EventSender,
  format: FrameFormat,
  max_buffered_frames: usize,
  enqueue_interval: Duration,
  enqueue_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedInput {
  pub fn new(
    input_id: InputId,
    source: Box<dyn InputVideoFrameSource>,
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
      inner: Arc::new(Mutex::new(QueuedInputInner {
        frames: VecDeque::new(),
        first_frame_time: None,
        first_frame_pts_ms: None,
        queue_start_time: None,
        received_eos: false,
        state: QueuedInputState::WaitingForStart,
        lifecycle: LifecycleTracker::default(),
      })),
      source: Arc::new(Mutex::new(source)),
      events,
      format,
      max_buffered_frames: options.max_buffered_frames.max(1),
      enqueue_interval: options.enqueue_interval(),
      enqueue_task: Mutex::new(None),
    }
  }

  fn lock_inner(&self) -> MutexGuard<'_, QueuedInputInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> QueuedInputState {
    self.lock_inner().state
  }

  pub fn buffered_frames(&self) -> usize {
    self.lock_inner().frames.len()
  }

  fn emit(&self, inner: &mut QueuedInputInner, step: InputLifecycle) {
    if inner.lifecycle.advance(step) {
      self.events.send(WorkerEvent::video(&self.input_id, step));
    }
  }

  fn stop_enqueue_task(&self) {
    let task = self
      .enqueue_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(task) = task {
      task.abort();
    }
  }
}

/// Pull frames until the buffer is full or the source has nothing ready.
///
/// Returns `false` once the source reported EOS.
fn try_enqueue(
  inner: &Mutex<QueuedInputInner>,
  source: &Mutex<Box<dyn InputVideoFrameSource>>,
  max_buffered_frames: usize,
  format: FrameFormat,
) -> bool {
  loop {
    let buffered = match inner.lock() {
      Ok(inner) => inner.frames.len(),
      Err(_) => {
        tracing::warn!(target: "smelter", "Input state lock poisoned, stopping pull loop");
        return false;
      }
    };
    if buffered >= max_buffered_frames {
      return true;
    }

    let poll = match source.lock() {
      Ok(mut source) => source.next_frame(),
      Err(_) => {
        tracing::warn!(target: "smelter", "Input source lock poisoned, stopping pull loop");
        return false;
      }
    };

    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    match poll {
      None => return true,
      Some(SourcePoll::Frame(frame)) => inner.push_frame(frame, format),
      Some(SourcePoll::Eos) => {
        inner.received_eos = true;
        return false;
      }
    }
  }
}

#[async_trait]
impl Input for QueuedInput {
  fn input_id(&self) -> &InputId {
    &self.input_id
  }

  fn start(&self) -> InputMetadata {
    let inner = self.inner.clone();
    let source = self.source.clone();
    let max_buffered_frames = self.max_buffered_frames;
    let format = self.format;
    let period = self.enqueue_interval;
    let input_id = self.input_id.clone();

    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        if !try_enqueue(&inner, &source, max_buffered_frames, format) {
          tracing::debug!(target: "smelter", input_id = %input_id, "Input source finished");
          break;
        }
      }
    });

    // A second start replaces the loop instead of running two
    let previous = self
      .enqueue_task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(task);
    if let Some(previous) = previous {
      previous.abort();
    }

    {
      let mut inner = self.lock_inner();
      if inner.state == QueuedInputState::WaitingForStart {
        inner.state = QueuedInputState::Buffering;
      }
      self.emit(&mut inner, InputLifecycle::Delivered);
    }

    self
      .source
      .lock()
      .map(|source| source.metadata())
      .unwrap_or_default()
  }

  fn close(&self) {
    self.stop_enqueue_task();
  }

  fn update_queue_start_time(&self, queue_start: Instant) {
    self.lock_inner().queue_start_time = Some(queue_start);
  }

  async fn get_frame(&self, current_queue_pts_ms: f64) -> Option<Frame> {
    let mut inner = self.lock_inner();
    let input_pts_ms = inner.queue_pts_to_input_pts(current_queue_pts_ms);
    inner.drop_old_frames(input_pts_ms);

    let frame_ref = inner.frames.front()?.clone();
    let frame = match frame_ref.sample() {
      Ok(frame) => frame,
      Err(err) => {
        tracing::warn!(target: "smelter", input_id = %self.input_id, "Failed to read frame: {}", err);
        return None;
      }
    };

    if inner.state == QueuedInputState::Buffering {
      inner.state = QueuedInputState::Playing;
      tracing::debug!(target: "smelter", input_id = %self.input_id, "Input started");
    }
    self.emit(&mut inner, InputLifecycle::Playing);

    if inner.frames.len() == 1 && inner.received_eos {
      if let Some(last) = inner.frames.pop_front() {
        last.decrement_ref_count();
      }
      inner.state = QueuedInputState::Finished;
      tracing::debug!(target: "smelter", input_id = %self.input_id, "Input finished");
      self.emit(&mut inner, InputLifecycle::Eos);
    }

    Some(frame)
  }
}

impl Drop for QueuedInput {
  fn drop(&mut self) {
    self.stop_enqueue_task();
    self.lock_inner().release_frames();
    if let Ok(mut source) = self.source.lock() {
      source.close();
    }
  }
}
