//! FrameTicker - fixed cadence clock driving queue ticks
//!
//! Tick `n` is scheduled at `start + n * frame_duration` and receives the
//! intended PTS, not the wall clock time. The callback is awaited before the
//! next tick is scheduled, so ticks never overlap. After a slow tick the
//! frame counter jumps forward instead of replaying the missed ticks.

use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::types::Framerate;

pub struct FrameTicker {
  framerate: Framerate,
  max_fast_forward_frames: u64,
  stop: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<()>>,
}

impl FrameTicker {
  pub fn new(framerate: Framerate, max_fast_forward_frames: u64) -> Self {
    Self {
      framerate,
      max_fast_forward_frames,
      stop: None,
      task: None,
    }
  }

  pub fn is_running(&self) -> bool {
    self.stop.is_some()
  }

  /// Start ticking with PTS 0 at `start`. Restarts if already running.
  pub fn start<F, Fut>(&mut self, start: Instant, on_tick: F)
  where
    F: FnMut(f64) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self.stop();
    let (stop_tx, stop_rx) = oneshot::channel();
    self.stop = Some(stop_tx);
    self.task = Some(tokio::spawn(run_ticker(
      self.framerate,
      self.max_fast_forward_frames,
      start,
      stop_rx,
      on_tick,
    )));
  }

  /// Cancel pending ticks. A tick already running completes.
  pub fn stop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    self.task = None;
  }
}

impl Drop for FrameTicker {
  fn drop(&mut self) {
    self.stop();
  }
}

async fn run_ticker<F, Fut>(
  framerate: Framerate,
  max_fast_forward_frames: u64,
  mut start: Instant,
  mut stop: oneshot::Receiver<()>,
  mut on_tick: F,
) where
  F: FnMut(f64) -> Fut + Send + 'static,
  Fut: Future<Output = Result<()>> + Send + 'static,
{
  let frame_duration = framerate.frame_duration();
  let mut frame_index: u64 = 0;

  loop {
    let deadline = start + framerate.pts_offset(frame_index);
    tokio::select! {
      _ = tokio::time::sleep_until(deadline) => {}
      _ = &mut stop => break,
    }

    let now = Instant::now();
    let mut skipped = 0;
    while now.saturating_duration_since(start) > framerate.pts_offset(frame_index) + frame_duration {
      if skipped >= max_fast_forward_frames {
        // Too far behind, restart the schedule from the current frame
        start = now.checked_sub(framerate.pts_offset(frame_index)).unwrap_or(start);
        tracing::info!(target: "smelter", frame_index, "Frame clock re-anchored");
        break;
      }
      frame_index += 1;
      skipped += 1;
    }
    if skipped > 0 {
      tracing::info!(target: "smelter", skipped, "Dropped frames after slow tick");
    }

    let pts_ms = framerate.pts_ms(frame_index);
    tracing::trace!(target: "smelter", pts_ms, "Tick");
    if let Err(err) = on_tick(pts_ms).await {
      tracing::warn!(target: "smelter", pts_ms, "Tick failed: {}", err);
    }
    frame_index += 1;
  }
}
