//! Queue - per tick orchestration of inputs, renderer and outputs
//!
//! Inputs and outputs are owned by the queue and keyed by id. On every tick
//! the queue samples all inputs concurrently, renders, and hands each
//! rendered frame to its output if that output is still registered.

pub mod ticker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::time::Instant;

use crate::config::PipelineOptions;
use crate::error::{lock, PipelineError, Result};
use crate::input::Input;
use crate::output::Output;
use crate::renderer::Renderer;
use crate::types::{InputFrameSet, InputId, OutputId, Resolution};

pub use ticker::FrameTicker;

/// Renderer shared between the queue and scene updates on the worker
pub type SharedRenderer = Arc<tokio::sync::Mutex<Box<dyn Renderer>>>;

#[derive(Default)]
struct QueueInner {
  inputs: HashMap<InputId, Arc<dyn Input>>,
  outputs: HashMap<OutputId, Box<dyn Output>>,
  start_time: Option<Instant>,
}

pub struct Queue {
  inner: Arc<Mutex<QueueInner>>,
  renderer: SharedRenderer,
  ticker: FrameTicker,
}

impl Queue {
  pub fn new(renderer: SharedRenderer, options: &PipelineOptions) -> Result<Self> {
    options.framerate.validate()?;
    Ok(Self {
      inner: Arc::new(Mutex::new(QueueInner::default())),
      renderer,
      ticker: FrameTicker::new(options.framerate, options.max_fast_forward_frames),
    })
  }

  pub fn add_input(&self, input: Arc<dyn Input>) -> Result<()> {
    let mut inner = lock!(self.inner);
    let input_id = input.input_id().clone();
    if inner.inputs.contains_key(&input_id) {
      return Err(PipelineError::InputAlreadyRegistered(input_id));
    }
    if let Some(start_time) = inner.start_time {
      input.update_queue_start_time(start_time);
    }
    inner.inputs.insert(input_id, input);
    Ok(())
  }

  /// Remove and close an input
  pub fn remove_input(&self, input_id: &InputId) -> Result<()> {
    let input = lock!(self.inner).inputs.remove(input_id);
    match input {
      Some(input) => {
        input.close();
        Ok(())
      }
      None => Err(PipelineError::InputNotFound(input_id.clone())),
    }
  }

  pub fn add_output(&self, output_id: OutputId, output: Box<dyn Output>) -> Result<()> {
    let mut inner = lock!(self.inner);
    if inner.outputs.contains_key(&output_id) {
      return Err(PipelineError::OutputAlreadyRegistered(output_id));
    }
    inner.outputs.insert(output_id, output);
    Ok(())
  }

  /// Remove and close an output
  pub fn remove_output(&self, output_id: &OutputId) -> Result<()> {
    let output = lock!(self.inner).outputs.remove(output_id);
    match output {
      Some(mut output) => {
        output.close();
        Ok(())
      }
      None => Err(PipelineError::OutputNotFound(output_id.clone())),
    }
  }

  pub fn output_resolution(&self, output_id: &OutputId) -> Result<Option<Resolution>> {
    Ok(lock!(self.inner).outputs.get(output_id).map(|output| output.resolution()))
  }

  pub fn is_started(&self) -> bool {
    self.ticker.is_running()
  }

  /// Start the clock and publish its start time to every registered input
  pub fn start(&mut self) -> Result<Instant> {
    if self.ticker.is_running() {
      return Err(PipelineError::AlreadyStarted);
    }
    let start_time = Instant::now();
    {
      let mut inner = lock!(self.inner);
      inner.start_time = Some(start_time);
      for input in inner.inputs.values() {
        input.update_queue_start_time(start_time);
      }
    }

    let inner = self.inner.clone();
    let renderer = self.renderer.clone();
    self.ticker.start(start_time, move |pts_ms| {
      let inner = inner.clone();
      let renderer = renderer.clone();
      async move { process_tick(&inner, &renderer, pts_ms).await }
    });
    tracing::debug!(target: "smelter", "Queue started");
    Ok(start_time)
  }

  /// Stop the clock and close every input
  pub fn stop(&mut self) {
    self.ticker.stop();
    let inner = self.inner.lock();
    match inner {
      Ok(inner) => {
        for input in inner.inputs.values() {
          input.close();
        }
      }
      Err(_) => tracing::warn!(target: "smelter", "Queue lock poisoned, inputs not closed"),
    }
  }
}

async fn process_tick(
  inner: &Mutex<QueueInner>,
  renderer: &tokio::sync::Mutex<Box<dyn Renderer>>,
  pts_ms: f64,
) -> Result<()> {
  let inputs: Vec<Arc<dyn Input>> = lock!(inner).inputs.values().cloned().collect();

  let frames = join_all(inputs.iter().map(|input| async move {
    let frame = input.get_frame(pts_ms).await?;
    Some((input.input_id().clone(), frame))
  }))
  .await;

  let input_frames = InputFrameSet {
    pts_ms,
    frames: frames.into_iter().flatten().collect(),
  };
  let rendered = renderer.lock().await.render(input_frames).await?;

  let mut inner = lock!(inner);
  for (output_id, frame) in rendered.frames {
    match inner.outputs.get_mut(&output_id) {
      Some(output) => output.send_frame(frame),
      None => {
        // Output unregistered while this tick was rendering
        tracing::warn!(target: "smelter", output_id = %output_id, "Dropping frame for unknown output");
      }
    }
  }
  Ok(())
}
