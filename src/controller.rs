//! Smelter - controller side API
//!
//! The controller owns everything that has to live outside the worker: the
//! user facing canvases and streams, audio mixing, WHIP sessions. It forwards
//! registration calls to the worker over the bridge and republishes worker
//! events to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::audio::{AudioDestination, AudioMixConfig, AudioMixer};
use crate::bridge::AsyncWorker;
use crate::config::PipelineOptions;
use crate::error::{PipelineError, Result};
use crate::event::{InputLifecycle, WorkerEvent};
use crate::input::InputMetadata;
use crate::output::{StreamOutput, WhipOptions, WhipOutput};
use crate::platform::{Canvas, MediaStream, OffscreenCanvas, Platform, TrackHandle};
use crate::renderer::Renderer;
use crate::types::{InputId, OutputId, Resolution};
use crate::worker::{
  spawn_worker_thread, FromWorker, InputSource, RegisterInput, RegisterOutput, Request, WorkerMessage,
  WorkerResponse,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct RegisterInputRequest {
  /// Video, decoded or read on the worker
  pub video: Option<InputSource>,
  /// Audio track mixed on this side into every output that has audio
  pub audio: Option<TrackHandle>,
}

pub enum OutputKind {
  /// Render into a canvas owned by the embedder, audio to the local device
  Canvas(Box<dyn Canvas>),
  /// Render into a new canvas and expose it as a `MediaStream`
  Stream,
  /// Like `Stream`, additionally sent to a WHIP endpoint
  Whip(WhipOptions),
}

pub struct RegisterOutputRequest {
  pub kind: OutputKind,
  pub resolution: Resolution,
  pub initial_video: serde_json::Value,
  /// Enables audio for this output
  pub initial_audio: Option<AudioMixConfig>,
}

enum OutputHandle {
  Canvas { mixer: Option<AudioMixer> },
  Stream(StreamOutput),
  Whip(WhipOutput),
}

impl OutputHandle {
  fn mixer_mut(&mut self) -> Option<&mut AudioMixer> {
    match self {
      OutputHandle::Canvas { mixer } => mixer.as_mut(),
      OutputHandle::Stream(output) => output.mixer_mut(),
      OutputHandle::Whip(output) => output.mixer_mut(),
    }
  }

  fn stream(&self) -> Option<MediaStream> {
    match self {
      OutputHandle::Canvas { .. } => None,
      OutputHandle::Stream(output) => Some(output.stream().clone()),
      OutputHandle::Whip(output) => Some(output.stream().clone()),
    }
  }

  async fn terminate(self) {
    match self {
      OutputHandle::Canvas { mixer } => {
        if let Some(mut mixer) = mixer {
          mixer.close();
        }
      }
      OutputHandle::Stream(mut output) => output.terminate(),
      OutputHandle::Whip(mut output) => output.terminate().await,
    }
  }
}

enum OutputSlot {
  /// Id taken, sink still being set up
  Reserved,
  Ready(OutputHandle),
}

struct InputEntry {
  has_video: bool,
  audio: Option<TrackHandle>,
  audio_eos: Option<JoinHandle<()>>,
}

pub struct Smelter {
  platform: Arc<dyn Platform>,
  worker: AsyncWorker,
  options: PipelineOptions,
  events: broadcast::Sender<WorkerEvent>,
  inputs: Mutex<HashMap<InputId, InputEntry>>,
  outputs: Mutex<HashMap<OutputId, OutputSlot>>,
}

impl Smelter {
  /// Start a worker thread and connect to it. Must be called inside a tokio runtime.
  pub fn spawn<F>(platform: Arc<dyn Platform>, create_renderer: F, options: PipelineOptions) -> Result<Self>
  where
    F: FnOnce(&PipelineOptions) -> Box<dyn Renderer> + Send + 'static,
  {
    crate::logging::init(&options.log_level);
    let channels = spawn_worker_thread(create_renderer, options.clone())?;
    Ok(Self::with_channels(
      platform,
      channels.requests,
      channels.responses,
      options,
    ))
  }

  /// Connect to a worker reachable through the given channels
  pub fn with_channels(
    platform: Arc<dyn Platform>,
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedReceiver<FromWorker>,
    options: PipelineOptions,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let forward = events.clone();
    let worker = AsyncWorker::new(requests, responses, move |event| {
      // No subscribers is fine
      let _ = forward.send(event);
    });
    Self {
      platform,
      worker,
      options,
      events,
      inputs: Mutex::new(HashMap::new()),
      outputs: Mutex::new(HashMap::new()),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
    self.events.subscribe()
  }

  fn lock_inputs(&self) -> MutexGuard<'_, HashMap<InputId, InputEntry>> {
    self.inputs.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_outputs(&self) -> MutexGuard<'_, HashMap<OutputId, OutputSlot>> {
    self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub async fn register_input(&self, input_id: InputId, request: RegisterInputRequest) -> Result<InputMetadata> {
    {
      let mut inputs = self.lock_inputs();
      if inputs.contains_key(&input_id) {
        return Err(PipelineError::InputAlreadyRegistered(input_id));
      }
      inputs.insert(
        input_id.clone(),
        InputEntry {
          has_video: request.video.is_some(),
          audio: None,
          audio_eos: None,
        },
      );
    }

    let mut metadata = InputMetadata::default();
    if let Some(source) = request.video {
      let response = self
        .worker
        .post(WorkerMessage::RegisterInput(RegisterInput {
          input_id: input_id.clone(),
          source,
        }))
        .await;
      match response {
        Ok(Some(WorkerResponse::RegisterInput(result))) => metadata = result,
        Ok(None) => {}
        Err(err) => {
          self.lock_inputs().remove(&input_id);
          return Err(err);
        }
      }
    }

    if let Some(track) = request.audio {
      self.attach_audio_input(&input_id, track);
    }
    Ok(metadata)
  }

  fn attach_audio_input(&self, input_id: &InputId, track: TrackHandle) {
    // Recorded before the scan so outputs that become ready later pick it up
    if let Some(entry) = self.lock_inputs().get_mut(input_id) {
      entry.audio = Some(track.clone());
    }
    {
      let mut outputs = self.lock_outputs();
      for slot in outputs.values_mut() {
        if let OutputSlot::Ready(handle) = slot {
          if let Some(mixer) = handle.mixer_mut() {
            if mixer.has_input(input_id) {
              continue;
            }
            if let Err(err) = mixer.add_input(input_id, &track) {
              tracing::warn!(target: "smelter", input_id = %input_id, "Failed to connect audio: {}", err);
            }
          }
        }
      }
    }

    let _ = self.events.send(WorkerEvent::audio(input_id, InputLifecycle::Delivered));
    let _ = self.events.send(WorkerEvent::audio(input_id, InputLifecycle::Playing));

    let events = self.events.clone();
    let eos_input_id = input_id.clone();
    let ended = track.ended();
    let audio_eos = tokio::spawn(async move {
      ended.await;
      tracing::debug!(target: "smelter", input_id = %eos_input_id, "Audio track ended");
      let _ = events.send(WorkerEvent::audio(&eos_input_id, InputLifecycle::Eos));
    });

    match self.lock_inputs().get_mut(input_id) {
      Some(entry) => entry.audio_eos = Some(audio_eos),
      // Unregistered meanwhile
      None => audio_eos.abort(),
    }
  }

  /// Audio tracks of every registered input
  fn audio_tracks(&self) -> Vec<(InputId, TrackHandle)> {
    self
      .lock_inputs()
      .iter()
      .filter_map(|(input_id, entry)| entry.audio.clone().map(|track| (input_id.clone(), track)))
      .collect()
  }

  pub async fn unregister_input(&self, input_id: &InputId) -> Result<()> {
    let entry = self
      .lock_inputs()
      .remove(input_id)
      .ok_or_else(|| PipelineError::InputNotFound(input_id.clone()))?;

    if let Some(audio_eos) = entry.audio_eos {
      audio_eos.abort();
    }
    if entry.audio.is_some() {
      let mut outputs = self.lock_outputs();
      for slot in outputs.values_mut() {
        if let OutputSlot::Ready(handle) = slot {
          if let Some(mixer) = handle.mixer_mut() {
            mixer.remove_input(input_id);
          }
        }
      }
    }

    if entry.has_video {
      self
        .worker
        .post(WorkerMessage::UnregisterInput {
          input_id: input_id.clone(),
        })
        .await?;
    }
    Ok(())
  }

  /// Register an output. Returns the output stream for stream and WHIP outputs.
  pub async fn register_output(
    &self,
    output_id: OutputId,
    request: RegisterOutputRequest,
  ) -> Result<Option<MediaStream>> {
    {
      let mut outputs = self.lock_outputs();
      if outputs.contains_key(&output_id) {
        return Err(PipelineError::OutputAlreadyRegistered(output_id));
      }
      outputs.insert(output_id.clone(), OutputSlot::Reserved);
    }

    match self.setup_output(&output_id, request).await {
      Ok(mut handle) => {
        let stream = handle.stream();
        let mut outputs = self.lock_outputs();
        if let Some(mixer) = handle.mixer_mut() {
          // Audio inputs may have come or gone while the worker was registering the output
          mixer.sync_inputs(&self.audio_tracks());
        }
        outputs.insert(output_id.clone(), OutputSlot::Ready(handle));
        drop(outputs);
        tracing::debug!(target: "smelter", output_id = %output_id, "Output registered");
        Ok(stream)
      }
      Err(err) => {
        self.lock_outputs().remove(&output_id);
        Err(err)
      }
    }
  }

  async fn setup_output(&self, output_id: &OutputId, request: RegisterOutputRequest) -> Result<OutputHandle> {
    let RegisterOutputRequest {
      kind,
      resolution,
      initial_video,
      initial_audio,
    } = request;

    let (mut handle, offscreen) = self.create_sink(kind, resolution, initial_audio.is_some()).await?;

    if let Some(mixer) = handle.mixer_mut() {
      if let Some(config) = initial_audio {
        mixer.update(config);
      }
      mixer.sync_inputs(&self.audio_tracks());
    }

    let registered = self
      .worker
      .post(WorkerMessage::RegisterOutput(RegisterOutput {
        output_id: output_id.clone(),
        resolution,
        initial_scene: initial_video,
        canvas: offscreen,
      }))
      .await;

    if let Err(err) = registered {
      handle.terminate().await;
      return Err(err);
    }
    Ok(handle)
  }

  async fn create_sink(
    &self,
    kind: OutputKind,
    resolution: Resolution,
    audio: bool,
  ) -> Result<(OutputHandle, Box<dyn OffscreenCanvas>)> {
    match kind {
      OutputKind::Canvas(canvas) => {
        let mixer = self.create_mixer(audio, AudioDestination::Device)?;
        let offscreen = canvas.transfer_control_to_offscreen();
        Ok((OutputHandle::Canvas { mixer }, offscreen))
      }
      OutputKind::Stream => {
        let canvas = self.platform.create_canvas(resolution)?;
        let mixer = self.create_mixer(audio, AudioDestination::Stream)?;
        let (output, offscreen) = StreamOutput::new(canvas, self.options.framerate, mixer)?;
        Ok((OutputHandle::Stream(output), offscreen))
      }
      OutputKind::Whip(options) => {
        let mut canvas = self.platform.create_canvas(resolution)?;
        let stream = canvas.capture_stream(self.options.framerate.frames_per_second())?;
        let offscreen = canvas.transfer_control_to_offscreen();
        let mixer = match self.create_mixer(audio, AudioDestination::Stream) {
          Ok(mixer) => mixer,
          Err(err) => {
            stream.stop_all();
            return Err(err);
          }
        };
        let output = WhipOutput::connect(
          self.platform.as_ref(),
          options,
          stream,
          mixer,
          self.options.ice_gathering_timeout(),
        )
        .await?;
        Ok((OutputHandle::Whip(output), offscreen))
      }
    }
  }

  fn create_mixer(&self, audio: bool, destination: AudioDestination) -> Result<Option<AudioMixer>> {
    if !audio {
      return Ok(None);
    }
    let graph = self.platform.create_audio_graph(destination)?;
    Ok(Some(AudioMixer::new(graph, destination)?))
  }

  pub async fn unregister_output(&self, output_id: &OutputId) -> Result<()> {
    let handle = {
      let mut outputs = self.lock_outputs();
      match outputs.remove(output_id) {
        Some(OutputSlot::Ready(handle)) => handle,
        Some(OutputSlot::Reserved) => {
          // Still being set up, leave the reservation alone
          outputs.insert(output_id.clone(), OutputSlot::Reserved);
          return Err(PipelineError::OutputNotFound(output_id.clone()));
        }
        None => return Err(PipelineError::OutputNotFound(output_id.clone())),
      }
    };

    let result = self
      .worker
      .post(WorkerMessage::UnregisterOutput {
        output_id: output_id.clone(),
      })
      .await;
    handle.terminate().await;
    result.map(|_| ())
  }

  pub async fn update_scene(
    &self,
    output_id: &OutputId,
    video: Option<serde_json::Value>,
    audio: Option<AudioMixConfig>,
  ) -> Result<()> {
    {
      let mut outputs = self.lock_outputs();
      match outputs.get_mut(output_id) {
        Some(OutputSlot::Ready(handle)) => {
          if let (Some(mixer), Some(config)) = (handle.mixer_mut(), audio) {
            mixer.update(config);
          }
        }
        _ => return Err(PipelineError::OutputNotFound(output_id.clone())),
      }
    }

    if let Some(scene) = video {
      self
        .worker
        .post(WorkerMessage::UpdateScene {
          output_id: output_id.clone(),
          scene,
        })
        .await?;
    }
    Ok(())
  }

  pub async fn register_image(&self, image_id: &str, spec: serde_json::Value) -> Result<()> {
    self
      .worker
      .post(WorkerMessage::RegisterImage {
        image_id: image_id.to_string(),
        spec,
      })
      .await?;
    Ok(())
  }

  pub async fn unregister_image(&self, image_id: &str) -> Result<()> {
    self
      .worker
      .post(WorkerMessage::UnregisterImage {
        image_id: image_id.to_string(),
      })
      .await?;
    Ok(())
  }

  pub async fn register_font(&self, url: &str) -> Result<()> {
    self
      .worker
      .post(WorkerMessage::RegisterFont { url: url.to_string() })
      .await?;
    Ok(())
  }

  pub async fn start(&self) -> Result<()> {
    self.worker.post(WorkerMessage::Start).await?;
    Ok(())
  }

  /// Stop the worker and release every output
  pub async fn terminate(&self) -> Result<()> {
    let result = self.worker.post(WorkerMessage::Terminate).await;

    let handles: Vec<OutputHandle> = self
      .lock_outputs()
      .drain()
      .filter_map(|(_, slot)| match slot {
        OutputSlot::Ready(handle) => Some(handle),
        OutputSlot::Reserved => None,
      })
      .collect();
    futures::future::join_all(handles.into_iter().map(OutputHandle::terminate)).await;

    for (_, entry) in self.lock_inputs().drain() {
      if let Some(audio_eos) = entry.audio_eos {
        audio_eos.abort();
      }
    }
    result.map(|_| ())
  }
}
