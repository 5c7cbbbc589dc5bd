//! Worker context: owns the queue, inputs, renderer and output sinks
//!
//! Requests arrive on a channel and each one is handled on its own task, so a
//! slow call (font download, image decode) does not hold up the others.
//! Exactly one response is posted per request. Events are posted on the same
//! channel, in the order they happen.

pub mod api;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::PipelineOptions;
use crate::error::{lock, PipelineError, Result};
use crate::event::{EventSender, WorkerEvent};
use crate::input::{Decoder, Input, InputMetadata, MediaStreamInput, QueuedInput};
use crate::output::CanvasOutput;
use crate::queue::{Queue, SharedRenderer};
use crate::renderer::{AssetLoader, Renderer};
use crate::types::{InputId, OutputId};

pub use api::{FromWorker, InputSource, RegisterInput, RegisterOutput, Request, WorkerMessage, WorkerResponse};

pub struct Pipeline {
  renderer: SharedRenderer,
  assets: Arc<dyn AssetLoader>,
  queue: Mutex<Queue>,
  events: EventSender,
  options: PipelineOptions,
}

impl Pipeline {
  pub fn new(renderer: Box<dyn Renderer>, options: PipelineOptions, events: EventSender) -> Result<Self> {
    let assets = renderer.asset_loader();
    let renderer: SharedRenderer = Arc::new(tokio::sync::Mutex::new(renderer));
    Ok(Self {
      queue: Mutex::new(Queue::new(renderer.clone(), &options)?),
      renderer,
      assets,
      events,
      options,
    })
  }

  pub async fn handle(&self, message: WorkerMessage) -> Result<Option<WorkerResponse>> {
    match message {
      WorkerMessage::RegisterInput(request) => {
        let metadata = self.register_input(request).await?;
        return Ok(Some(WorkerResponse::RegisterInput(metadata)));
      }
      WorkerMessage::UnregisterInput { input_id } => self.unregister_input(&input_id).await?,
      WorkerMessage::RegisterOutput(request) => self.register_output(request).await?,
      WorkerMessage::UnregisterOutput { output_id } => self.unregister_output(&output_id).await?,
      WorkerMessage::UpdateScene { output_id, scene } => self.update_scene(&output_id, scene).await?,
      WorkerMessage::RegisterImage { image_id, spec } => self.register_image(&image_id, spec).await?,
      WorkerMessage::UnregisterImage { image_id } => {
        self.renderer.lock().await.unregister_image(&image_id)?
      }
      WorkerMessage::RegisterFont { url } => self.register_font(&url).await?,
      WorkerMessage::Start => self.start()?,
      WorkerMessage::Terminate => self.terminate(),
    }
    Ok(None)
  }

  pub fn start(&self) -> Result<()> {
    lock!(self.queue).start()?;
    Ok(())
  }

  pub fn terminate(&self) {
    match self.queue.lock() {
      Ok(mut queue) => queue.stop(),
      Err(_) => tracing::warn!(target: "smelter", "Queue lock poisoned during terminate"),
    }
  }

  /// Load the image outside the renderer lock, then register the bytes
  pub async fn register_image(&self, image_id: &str, spec: serde_json::Value) -> Result<()> {
    let image = self.assets.load_image(image_id, spec).await?;
    self.renderer.lock().await.register_image(image_id, image)?;
    tracing::debug!(target: "smelter", image_id, "Image registered");
    Ok(())
  }

  /// Download the font outside the renderer lock, then register the bytes
  pub async fn register_font(&self, url: &str) -> Result<()> {
    let font = self.assets.load_font(url).await?;
    self.renderer.lock().await.register_font(font)?;
    tracing::debug!(target: "smelter", url, "Font registered");
    Ok(())
  }

  pub async fn register_input(&self, request: RegisterInput) -> Result<InputMetadata> {
    let RegisterInput { input_id, source } = request;
    let input: Arc<dyn Input> = match source {
      InputSource::Decoded(source) => Arc::new(QueuedInput::new(
        input_id.clone(),
        source,
        self.events.clone(),
        &self.options,
      )),
      InputSource::Encoded { source, create_backend } => Arc::new(QueuedInput::new(
        input_id.clone(),
        Box::new(Decoder::new(source, &self.options, create_backend)),
        self.events.clone(),
        &self.options,
      )),
      InputSource::Track(reader) => Arc::new(MediaStreamInput::new(
        input_id.clone(),
        reader,
        self.events.clone(),
        &self.options,
      )),
    };

    // Rejects duplicates without touching the registered input
    lock!(self.queue).add_input(input.clone())?;
    self.renderer.lock().await.register_input(&input_id);
    tracing::debug!(target: "smelter", input_id = %input_id, "Input registered");
    Ok(input.start())
  }

  pub async fn unregister_input(&self, input_id: &InputId) -> Result<()> {
    lock!(self.queue).remove_input(input_id)?;
    self.renderer.lock().await.unregister_input(input_id);
    tracing::debug!(target: "smelter", input_id = %input_id, "Input unregistered");
    Ok(())
  }

  /// Queue entry and renderer scene are registered together or not at all
  pub async fn register_output(&self, request: RegisterOutput) -> Result<()> {
    let RegisterOutput {
      output_id,
      resolution,
      initial_scene,
      canvas,
    } = request;

    let output = CanvasOutput::new(canvas, resolution);
    lock!(self.queue).add_output(output_id.clone(), Box::new(output))?;

    let mut renderer = self.renderer.lock().await;
    // update_scene implicitly registers the output on the renderer side
    if let Err(err) = renderer.update_scene(&output_id, resolution, initial_scene) {
      renderer.unregister_output(&output_id);
      drop(renderer);
      if let Err(remove_err) = lock!(self.queue).remove_output(&output_id) {
        tracing::warn!(target: "smelter", output_id = %output_id, "Rollback failed: {}", remove_err);
      }
      return Err(err.into());
    }
    tracing::debug!(target: "smelter", output_id = %output_id, "Output registered");
    Ok(())
  }

  pub async fn unregister_output(&self, output_id: &OutputId) -> Result<()> {
    lock!(self.queue).remove_output(output_id)?;
    self.renderer.lock().await.unregister_output(output_id);
    self.events.send(WorkerEvent::OutputDone {
      output_id: output_id.clone(),
    });
    Ok(())
  }

  pub async fn update_scene(&self, output_id: &OutputId, scene: serde_json::Value) -> Result<()> {
    let resolution = lock!(self.queue)
      .output_resolution(output_id)?
      .ok_or_else(|| PipelineError::OutputNotFound(output_id.clone()))?;
    self
      .renderer
      .lock()
      .await
      .update_scene(output_id, resolution, scene)?;
    Ok(())
  }
}

fn respond(responses: &mpsc::UnboundedSender<FromWorker>, id: u64, result: Result<Option<WorkerResponse>>) {
  let message = match result {
    Ok(response) => FromWorker::Response {
      id,
      response,
      error: None,
    },
    Err(err) => FromWorker::Response {
      id,
      response: None,
      error: Some(err.to_string()),
    },
  };
  if responses.send(message).is_err() {
    tracing::debug!(target: "smelter", id, "Controller gone, response dropped");
  }
}

/// Event sender posting onto the worker's outgoing channel
pub fn event_sender(responses: &mpsc::UnboundedSender<FromWorker>) -> EventSender {
  let responses = responses.clone();
  EventSender::new(move |event| {
    if responses.send(FromWorker::Event(event)).is_err() {
      tracing::debug!(target: "smelter", "Controller gone, event dropped");
    }
  })
}

/// Serve requests until `Terminate` or until the controller side hangs up
pub async fn run_worker(
  pipeline: Arc<Pipeline>,
  mut requests: mpsc::UnboundedReceiver<Request>,
  responses: mpsc::UnboundedSender<FromWorker>,
) {
  while let Some(Request { id, message }) = requests.recv().await {
    tracing::trace!(target: "smelter", id, message = message.name(), "Worker request");
    if let WorkerMessage::Terminate = message {
      pipeline.terminate();
      respond(&responses, id, Ok(None));
      return;
    }

    let pipeline = pipeline.clone();
    let responses = responses.clone();
    tokio::spawn(async move {
      let result = pipeline.handle(message).await;
      if let Err(err) = &result {
        tracing::warn!(target: "smelter", id, "Worker request failed: {}", err);
      }
      respond(&responses, id, result);
    });
  }
  pipeline.terminate();
}

/// Controller side ends of a worker's channels
pub struct WorkerChannels {
  pub requests: mpsc::UnboundedSender<Request>,
  pub responses: mpsc::UnboundedReceiver<FromWorker>,
  pub thread: std::thread::JoinHandle<()>,
}

/// Host a worker on a dedicated thread with its own runtime.
///
/// The renderer is created on that thread, from the same options the pipeline
/// runs with (the renderer owns `stream_fallback_timeout_ms`).
pub fn spawn_worker_thread<F>(create_renderer: F, options: PipelineOptions) -> Result<WorkerChannels>
where
  F: FnOnce(&PipelineOptions) -> Box<dyn Renderer> + Send + 'static,
{
  options.validate()?;
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .map_err(|err| PipelineError::Worker(format!("Failed to create worker runtime: {}", err)))?;

  let (request_tx, request_rx) = mpsc::unbounded_channel();
  let (response_tx, response_rx) = mpsc::unbounded_channel();

  let thread = std::thread::Builder::new()
    .name("smelter-worker".to_string())
    .spawn(move || {
      let events = event_sender(&response_tx);
      match Pipeline::new(create_renderer(&options), options, events) {
        Ok(pipeline) => runtime.block_on(run_worker(Arc::new(pipeline), request_rx, response_tx)),
        // Dropping the channels fails every pending request on the controller side
        Err(err) => tracing::error!(target: "smelter", "Failed to create pipeline: {}", err),
      }
    })
    .map_err(|err| PipelineError::Worker(format!("Failed to spawn worker thread: {}", err)))?;

  Ok(WorkerChannels {
    requests: request_tx,
    responses: response_rx,
    thread,
  })
}
