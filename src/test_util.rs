//! In-process fakes for the platform seams

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossbeam::channel::Sender;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::{AudioDestination, AudioGraph, NodeId};
use crate::config::PipelineOptions;
use crate::error::Result;
use crate::frame::VideoFrameHandle;
use crate::input::{
  ChunkPoll, DecodedFrame, DecoderOutput, EncodedVideoChunk, EncodedVideoSource, Input, InputMetadata,
  InputVideoFrameSource, SourcePoll, VideoDecoderBackend, VideoTrackReader,
};
use crate::output::whip::{
  IceGatheringState, PeerConnection, PeerConnectionEvent, RtcConfiguration, SdpType, SessionDescription,
  TransceiverInit,
};
use crate::output::Output;
use crate::platform::{Canvas, MediaStream, MediaTrack, OffscreenCanvas, Platform, TrackHandle, TrackKind};
use crate::queue::SharedRenderer;
use crate::renderer::{AssetLoader, LoadedImage, Renderer, RendererError, RendererResult};
use crate::types::{Frame, FrameFormat, InputFrameSet, InputId, OutputFrameSet, OutputId, Resolution};
use crate::worker::{event_sender, run_worker, FromWorker, Pipeline, Request};

const FRAME_RESOLUTION: Resolution = Resolution {
  width: 2,
  height: 2,
};

#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
  pub fn increment(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }

  pub fn count(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

pub fn solid_frame(resolution: Resolution, fill: u8) -> Frame {
  Frame {
    resolution,
    format: FrameFormat::RgbaBytes,
    data: vec![fill; FrameFormat::RgbaBytes.byte_len(resolution)].into(),
  }
}

/// 2x2 frame filled with a single byte value
pub struct FakeFrameHandle {
  fill: u8,
  timestamp_us: i64,
  closed: Counter,
  copies: Counter,
  is_closed: bool,
}

impl FakeFrameHandle {
  pub fn new(fill: u8) -> (Self, Counter) {
    let closed = Counter::default();
    (Self::with_timestamp(fill, 0, closed.clone()), closed)
  }

  pub fn with_timestamp(fill: u8, timestamp_us: i64, closed: Counter) -> Self {
    Self {
      fill,
      timestamp_us,
      closed,
      copies: Counter::default(),
      is_closed: false,
    }
  }

  pub fn copies(&self) -> Counter {
    self.copies.clone()
  }
}

impl VideoFrameHandle for FakeFrameHandle {
  fn timestamp_us(&self) -> i64 {
    self.timestamp_us
  }

  fn resolution(&self) -> Resolution {
    FRAME_RESOLUTION
  }

  fn copy_to(&self, format: FrameFormat) -> Result<Vec<u8>> {
    assert!(!self.is_closed, "copy from a closed frame");
    self.copies.increment();
    Ok(vec![self.fill; format.byte_len(FRAME_RESOLUTION)])
  }

  fn close(&mut self) {
    if !self.is_closed {
      self.is_closed = true;
      self.closed.increment();
    }
  }
}

/// Chunk source yielding the given timestamps, then EOS forever
pub struct ScriptedChunkSource {
  timestamps: VecDeque<i64>,
  pulled: Counter,
}

impl ScriptedChunkSource {
  pub fn new(timestamps: Vec<i64>) -> Self {
    Self {
      timestamps: timestamps.into(),
      pulled: Counter::default(),
    }
  }

  pub fn pulled(&self) -> Counter {
    self.pulled.clone()
  }
}

impl EncodedVideoSource for ScriptedChunkSource {
  fn metadata(&self) -> InputMetadata {
    InputMetadata::default()
  }

  fn next_chunk(&mut self) -> Option<ChunkPoll> {
    match self.timestamps.pop_front() {
      Some(timestamp_us) => {
        self.pulled.increment();
        Some(ChunkPoll::Chunk(EncodedVideoChunk {
          data: Vec::new(),
          timestamp_us,
          duration_us: None,
          key: true,
        }))
      }
      None => Some(ChunkPoll::Eos),
    }
  }
}

/// Decodes each chunk immediately, or holds every chunk until flushed
pub struct SyncDecoderBackend {
  sender: Sender<DecoderOutput>,
  hold_until_flush: bool,
  held: Vec<i64>,
  decoded: usize,
  closed: Counter,
}

impl SyncDecoderBackend {
  pub fn new(sender: Sender<DecoderOutput>, hold_until_flush: bool) -> Self {
    Self {
      sender,
      hold_until_flush,
      held: Vec::new(),
      decoded: 0,
      closed: Counter::default(),
    }
  }

  /// Counts frames closed by their consumer
  pub fn closed_frames(&self) -> Counter {
    self.closed.clone()
  }

  fn emit(&mut self, timestamp_us: i64) {
    let handle = FakeFrameHandle::with_timestamp(self.decoded as u8, timestamp_us, self.closed.clone());
    self.decoded += 1;
    let _ = self.sender.send(DecoderOutput::Frame(Box::new(handle)));
  }
}

impl VideoDecoderBackend for SyncDecoderBackend {
  fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<()> {
    if self.hold_until_flush {
      self.held.push(chunk.timestamp_us);
    } else {
      self.emit(chunk.timestamp_us);
    }
    Ok(())
  }

  fn decode_queue_size(&self) -> usize {
    self.held.len()
  }

  fn flush(&mut self) -> Result<()> {
    for timestamp_us in std::mem::take(&mut self.held) {
      self.emit(timestamp_us);
    }
    Ok(())
  }

  fn close(&mut self) {
    self.held.clear();
  }
}

/// Decoded source yielding frames at the given pts. Frame `i` is filled with `i`.
pub struct ScriptedFrameSource {
  pts: VecDeque<f64>,
  index: usize,
  eos: bool,
  duration_ms: Option<f64>,
  pulled: Counter,
  closed: Counter,
}

impl ScriptedFrameSource {
  pub fn new(pts: Vec<f64>) -> Self {
    Self {
      pts: pts.into(),
      index: 0,
      eos: true,
      duration_ms: None,
      pulled: Counter::default(),
      closed: Counter::default(),
    }
  }

  /// Report "no frame yet" instead of EOS once exhausted
  pub fn without_eos(mut self) -> Self {
    self.eos = false;
    self
  }

  pub fn with_duration(mut self, duration_ms: f64) -> Self {
    self.duration_ms = Some(duration_ms);
    self
  }

  pub fn pulled(&self) -> Counter {
    self.pulled.clone()
  }

  pub fn closed_frames(&self) -> Counter {
    self.closed.clone()
  }
}

impl InputVideoFrameSource for ScriptedFrameSource {
  fn metadata(&self) -> InputMetadata {
    InputMetadata {
      video_duration_ms: self.duration_ms,
      audio_duration_ms: None,
    }
  }

  fn next_frame(&mut self) -> Option<SourcePoll> {
    match self.pts.pop_front() {
      Some(pts_ms) => {
        let handle = FakeFrameHandle::with_timestamp(
          self.index as u8,
          (pts_ms * 1000.0) as i64,
          self.closed.clone(),
        );
        self.index += 1;
        self.pulled.increment();
        Some(SourcePoll::Frame(DecodedFrame {
          handle: Box::new(handle),
          pts_ms,
        }))
      }
      None if self.eos => Some(SourcePoll::Eos),
      None => None,
    }
  }
}

/// Track reader fed from a channel. Dropping the sender ends the track.
pub struct ChannelTrackReader {
  frames: mpsc::UnboundedReceiver<Box<dyn VideoFrameHandle>>,
  cancelled: Counter,
}

impl ChannelTrackReader {
  pub fn new() -> (Self, mpsc::UnboundedSender<Box<dyn VideoFrameHandle>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Self {
        frames: rx,
        cancelled: Counter::default(),
      },
      tx,
    )
  }

  pub fn cancelled(&self) -> Counter {
    self.cancelled.clone()
  }
}

#[async_trait]
impl VideoTrackReader for ChannelTrackReader {
  async fn read(&mut self) -> Option<Box<dyn VideoFrameHandle>> {
    self.frames.recv().await
  }

  fn cancel(&mut self) {
    self.cancelled.increment();
    self.frames.close();
  }
}

pub struct FakeTrack {
  id: String,
  kind: TrackKind,
  stopped: AtomicBool,
  ended: watch::Sender<bool>,
}

impl FakeTrack {
  fn create(id: &str, kind: TrackKind) -> Arc<Self> {
    let (ended, _) = watch::channel(false);
    Arc::new(Self {
      id: id.to_string(),
      kind,
      stopped: AtomicBool::new(false),
      ended,
    })
  }

  pub fn audio(id: &str) -> Arc<Self> {
    Self::create(id, TrackKind::Audio)
  }

  pub fn video(id: &str) -> Arc<Self> {
    Self::create(id, TrackKind::Video)
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::SeqCst)
  }

  /// Simulate the remote end closing the track
  pub fn end(&self) {
    self.ended.send_replace(true);
  }
}

impl MediaTrack for FakeTrack {
  fn id(&self) -> String {
    self.id.clone()
  }

  fn kind(&self) -> TrackKind {
    self.kind
  }

  fn stop(&self) {
    self.stopped.store(true, Ordering::SeqCst);
  }

  fn ended(&self) -> BoxFuture<'static, ()> {
    let mut ended = self.ended.subscribe();
    async move {
      let _ = ended.wait_for(|ended| *ended).await;
    }
    .boxed()
  }
}

enum FakeNode {
  Destination,
  TrackSource(String),
  Gain(f32),
  Silence,
}

struct FakeGraphState {
  nodes: HashMap<NodeId, FakeNode>,
  connections: Vec<(NodeId, NodeId)>,
  next_node: u64,
  closed: bool,
}

pub struct FakeAudioGraph {
  state: Arc<Mutex<FakeGraphState>>,
  output_track: Option<Arc<FakeTrack>>,
}

#[derive(Clone)]
pub struct AudioGraphProbe {
  state: Arc<Mutex<FakeGraphState>>,
  output_track: Option<Arc<FakeTrack>>,
}

impl FakeAudioGraph {
  /// Graph with a stream destination
  pub fn new() -> (Self, AudioGraphProbe) {
    Self::for_destination(AudioDestination::Stream)
  }

  pub fn for_destination(destination: AudioDestination) -> (Self, AudioGraphProbe) {
    let state = Arc::new(Mutex::new(FakeGraphState {
      nodes: HashMap::from([(NodeId(0), FakeNode::Destination)]),
      connections: Vec::new(),
      next_node: 1,
      closed: false,
    }));
    let output_track = match destination {
      AudioDestination::Stream => Some(FakeTrack::audio("mixed-audio")),
      AudioDestination::Device => None,
    };
    (
      Self {
        state: state.clone(),
        output_track: output_track.clone(),
      },
      AudioGraphProbe { state, output_track },
    )
  }

  fn add_node(&mut self, node: FakeNode) -> NodeId {
    let mut state = self.state.lock().unwrap();
    let id = NodeId(state.next_node);
    state.next_node += 1;
    state.nodes.insert(id, node);
    id
  }
}

impl AudioGraph for FakeAudioGraph {
  fn destination(&self) -> NodeId {
    NodeId(0)
  }

  fn create_track_source(&mut self, track: &TrackHandle) -> Result<NodeId> {
    Ok(self.add_node(FakeNode::TrackSource(track.id())))
  }

  fn create_gain(&mut self) -> Result<NodeId> {
    Ok(self.add_node(FakeNode::Gain(1.0)))
  }

  fn create_silent_source(&mut self) -> Result<NodeId> {
    Ok(self.add_node(FakeNode::Silence))
  }

  fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
    self.state.lock().unwrap().connections.push((from, to));
    Ok(())
  }

  fn disconnect(&mut self, node: NodeId) {
    self.state.lock().unwrap().connections.retain(|(from, _)| *from != node);
  }

  fn set_gain(&mut self, node: NodeId, gain: f32) {
    if let Some(FakeNode::Gain(value)) = self.state.lock().unwrap().nodes.get_mut(&node) {
      *value = gain;
    }
  }

  fn output_track(&self) -> Option<TrackHandle> {
    self.output_track.clone().map(|track| track as TrackHandle)
  }

  fn close(&mut self) {
    self.state.lock().unwrap().closed = true;
  }
}

impl AudioGraphProbe {
  /// Gain applied to a connected track, `None` when the track is not connected
  pub fn gain_for_track(&self, track_id: &str) -> Option<f32> {
    let state = self.state.lock().unwrap();
    let source = state.nodes.iter().find_map(|(id, node)| match node {
      FakeNode::TrackSource(track) if track == track_id => Some(*id),
      _ => None,
    });
    let source = source?;
    state
      .connections
      .iter()
      .filter(|(from, _)| *from == source)
      .find_map(|(_, to)| match state.nodes.get(to) {
        Some(FakeNode::Gain(gain)) => Some(*gain),
        _ => None,
      })
  }

  pub fn connection_count(&self) -> usize {
    self.state.lock().unwrap().connections.len()
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().unwrap().closed
  }

  pub fn output_track_stopped(&self) -> bool {
    self.output_track.as_ref().is_some_and(|track| track.is_stopped())
  }
}

#[derive(Clone, Default)]
pub struct CanvasProbe {
  painted: Arc<Mutex<Vec<u8>>>,
  closes: Counter,
}

impl CanvasProbe {
  /// First byte of every painted frame
  pub fn painted(&self) -> Vec<u8> {
    self.painted.lock().unwrap().clone()
  }

  pub fn is_closed(&self) -> bool {
    self.closes.count() > 0
  }

  pub fn close_count(&self) -> usize {
    self.closes.count()
  }
}

pub struct FakeOffscreenCanvas {
  probe: CanvasProbe,
}

impl FakeOffscreenCanvas {
  pub fn new() -> (Self, CanvasProbe) {
    let probe = CanvasProbe::default();
    (Self { probe: probe.clone() }, probe)
  }
}

impl OffscreenCanvas for FakeOffscreenCanvas {
  fn paint(&mut self, frame: &Frame) -> Result<()> {
    self.probe.painted.lock().unwrap().push(frame.data[0]);
    Ok(())
  }

  fn close(&mut self) {
    self.probe.closes.increment();
  }
}

#[derive(Clone, Default)]
pub struct FakeCanvasProbe {
  capture_rate: Arc<Mutex<Option<f64>>>,
  video_track: Arc<Mutex<Option<Arc<FakeTrack>>>>,
  offscreen: CanvasProbe,
}

impl FakeCanvasProbe {
  pub fn capture_rate(&self) -> Option<f64> {
    *self.capture_rate.lock().unwrap()
  }

  pub fn video_track_stopped(&self) -> bool {
    self
      .video_track
      .lock()
      .unwrap()
      .as_ref()
      .is_some_and(|track| track.is_stopped())
  }

  pub fn painted(&self) -> Vec<u8> {
    self.offscreen.painted()
  }
}

pub struct FakeCanvas {
  probe: FakeCanvasProbe,
}

impl FakeCanvas {
  pub fn new(_resolution: Resolution) -> (Self, FakeCanvasProbe) {
    let probe = FakeCanvasProbe::default();
    (Self { probe: probe.clone() }, probe)
  }
}

impl Canvas for FakeCanvas {
  fn capture_stream(&mut self, frames_per_second: f64) -> Result<MediaStream> {
    *self.probe.capture_rate.lock().unwrap() = Some(frames_per_second);
    let track = FakeTrack::video("canvas-video");
    *self.probe.video_track.lock().unwrap() = Some(track.clone());
    let mut stream = MediaStream::new();
    stream.add_track(track);
    Ok(stream)
  }

  fn transfer_control_to_offscreen(self: Box<Self>) -> Box<dyn OffscreenCanvas> {
    Box::new(FakeOffscreenCanvas {
      probe: self.probe.offscreen.clone(),
    })
  }
}

/// Peer connection that negotiates instantly and gathers no candidates
pub struct FakePeerConnection {
  config: RtcConfiguration,
  events: broadcast::Sender<PeerConnectionEvent>,
  transceivers: Mutex<Vec<TransceiverInit>>,
  local: Mutex<Option<SessionDescription>>,
  remote: Mutex<Option<SessionDescription>>,
  gathering: Mutex<IceGatheringState>,
  closed: AtomicBool,
}

impl FakePeerConnection {
  pub fn new(config: RtcConfiguration) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      config,
      events,
      transceivers: Mutex::new(Vec::new()),
      local: Mutex::new(None),
      remote: Mutex::new(None),
      gathering: Mutex::new(IceGatheringState::New),
      closed: AtomicBool::new(false),
    }
  }

  pub fn remote_sdp(&self) -> Option<String> {
    self.remote.lock().unwrap().as_ref().map(|description| description.sdp.clone())
  }

  pub fn rtc_configuration(&self) -> RtcConfiguration {
    self.config.clone()
  }

  pub fn transceivers(&self) -> Vec<TransceiverInit> {
    self.transceivers.lock().unwrap().clone()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
  fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent> {
    self.events.subscribe()
  }

  fn add_transceiver(&self, _track: TrackHandle, init: TransceiverInit) -> Result<()> {
    self.transceivers.lock().unwrap().push(init);
    let _ = self.events.send(PeerConnectionEvent::NegotiationNeeded);
    Ok(())
  }

  async fn create_offer(&self) -> Result<SessionDescription> {
    Ok(SessionDescription {
      sdp_type: SdpType::Offer,
      sdp: "v=0 offer".to_string(),
    })
  }

  async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
    *self.local.lock().unwrap() = Some(description);
    *self.gathering.lock().unwrap() = IceGatheringState::Complete;
    let _ = self
      .events
      .send(PeerConnectionEvent::IceGatheringStateChange(IceGatheringState::Complete));
    Ok(())
  }

  fn local_description(&self) -> Option<SessionDescription> {
    self.local.lock().unwrap().clone()
  }

  fn ice_gathering_state(&self) -> IceGatheringState {
    *self.gathering.lock().unwrap()
  }

  async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
    *self.remote.lock().unwrap() = Some(description);
    Ok(())
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }
}

#[derive(Default)]
pub struct FakePlatform {
  peer_connections: Mutex<Vec<Arc<FakePeerConnection>>>,
  canvases: Mutex<Vec<FakeCanvasProbe>>,
  audio_graphs: Mutex<Vec<AudioGraphProbe>>,
}

impl FakePlatform {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn last_peer_connection(&self) -> Option<Arc<FakePeerConnection>> {
    self.peer_connections.lock().unwrap().last().cloned()
  }

  pub fn canvases_created(&self) -> usize {
    self.canvases.lock().unwrap().len()
  }

  pub fn last_canvas(&self) -> Option<FakeCanvasProbe> {
    self.canvases.lock().unwrap().last().cloned()
  }

  pub fn audio_graphs(&self) -> Vec<AudioGraphProbe> {
    self.audio_graphs.lock().unwrap().clone()
  }
}

impl Platform for FakePlatform {
  fn create_canvas(&self, resolution: Resolution) -> Result<Box<dyn Canvas>> {
    let (canvas, probe) = FakeCanvas::new(resolution);
    self.canvases.lock().unwrap().push(probe);
    Ok(Box::new(canvas))
  }

  fn create_peer_connection(&self, config: RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
    let pc = Arc::new(FakePeerConnection::new(config));
    self.peer_connections.lock().unwrap().push(pc.clone());
    Ok(pc as Arc<dyn PeerConnection>)
  }

  fn create_audio_graph(&self, destination: AudioDestination) -> Result<Box<dyn AudioGraph>> {
    let (graph, probe) = FakeAudioGraph::for_destination(destination);
    self.audio_graphs.lock().unwrap().push(probe);
    Ok(Box::new(graph))
  }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
  status: u16,
  body: String,
  headers: Vec<(String, String)>,
}

impl MockResponse {
  pub fn new(status: u16, body: &str) -> Self {
    Self {
      status,
      body: body.to_string(),
      headers: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  fn to_bytes(&self) -> Vec<u8> {
    let mut head = format!(
      "HTTP/1.1 {} Mock\r\nContent-Length: {}\r\nConnection: close\r\n",
      self.status,
      self.body.len()
    );
    for (name, value) in &self.headers {
      head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(self.body.as_bytes());
    bytes
  }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
  pub method: String,
  pub path: String,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl RecordedRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(header, _)| header.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }
}

/// HTTP/1.1 server answering connections with canned responses, in order
pub struct MockHttpServer {
  addr: SocketAddr,
  requests: Arc<Mutex<Vec<RecordedRequest>>>,
  task: JoinHandle<()>,
}

impl MockHttpServer {
  pub async fn start(responses: Vec<MockResponse>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let task = tokio::spawn(async move {
      for response in responses {
        let Ok((mut socket, _)) = listener.accept().await else {
          return;
        };
        let Some(request) = read_request(&mut socket).await else {
          return;
        };
        recorded.lock().unwrap().push(request);
        let _ = socket.write_all(&response.to_bytes()).await;
        let _ = socket.shutdown().await;
      }
    });

    Self { addr, requests, task }
  }

  pub fn url(&self, path: &str) -> String {
    format!("http://{}{}", self.addr, path)
  }

  pub fn requests(&self) -> Vec<RecordedRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl Drop for MockHttpServer {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];
  let header_end = loop {
    if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
      break pos;
    }
    let n = socket.read(&mut chunk).await.ok()?;
    if n == 0 {
      return None;
    }
    buf.extend_from_slice(&chunk[..n]);
  };

  let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
  let mut lines = head.split("\r\n");
  let mut request_line = lines.next()?.split(' ');
  let method = request_line.next()?.to_string();
  let path = request_line.next()?.to_string();
  let headers: Vec<(String, String)> = lines
    .filter_map(|line| line.split_once(':'))
    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
    .collect();

  let content_length = headers
    .iter()
    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    .and_then(|(_, value)| value.parse::<usize>().ok())
    .unwrap_or(0);
  let mut body = buf[header_end + 4..].to_vec();
  while body.len() < content_length {
    let n = socket.read(&mut chunk).await.ok()?;
    if n == 0 {
      break;
    }
    body.extend_from_slice(&chunk[..n]);
  }

  Some(RecordedRequest {
    method,
    path,
    headers,
    body: String::from_utf8_lossy(&body).to_string(),
  })
}

#[derive(Default)]
struct RendererState {
  inputs: HashSet<InputId>,
  scenes: HashMap<OutputId, Resolution>,
  renders: Vec<(f64, Vec<InputId>)>,
  images: HashSet<String>,
  fonts: Vec<Vec<u8>>,
}

/// Asset loader answering after a fixed delay. Font bytes are the url bytes.
pub struct DelayedAssetLoader {
  delay: std::time::Duration,
}

#[async_trait]
impl AssetLoader for DelayedAssetLoader {
  async fn load_image(&self, _image_id: &str, spec: serde_json::Value) -> RendererResult<LoadedImage> {
    tokio::time::sleep(self.delay).await;
    if spec.get("invalid").is_some() {
      return Err(RendererError::from("invalid image"));
    }
    Ok(LoadedImage {
      spec,
      data: vec![0; 4],
    })
  }

  async fn load_font(&self, url: &str) -> RendererResult<Vec<u8>> {
    tokio::time::sleep(self.delay).await;
    Ok(url.as_bytes().to_vec())
  }
}

/// Renderer producing a black frame for every output with a scene
pub struct RecordingRenderer {
  state: Arc<Mutex<RendererState>>,
  assets: Arc<DelayedAssetLoader>,
}

#[derive(Clone)]
pub struct RendererProbe {
  state: Arc<Mutex<RendererState>>,
}

impl RecordingRenderer {
  pub fn new() -> (Self, RendererProbe) {
    Self::with_asset_delay(std::time::Duration::ZERO)
  }

  pub fn with_asset_delay(delay: std::time::Duration) -> (Self, RendererProbe) {
    let state = Arc::new(Mutex::new(RendererState::default()));
    (
      Self {
        state: state.clone(),
        assets: Arc::new(DelayedAssetLoader { delay }),
      },
      RendererProbe { state },
    )
  }
}

#[async_trait]
impl Renderer for RecordingRenderer {
  async fn render(&mut self, input: InputFrameSet) -> RendererResult<OutputFrameSet> {
    let mut state = self.state.lock().unwrap();
    let mut input_ids: Vec<InputId> = input.frames.keys().cloned().collect();
    input_ids.sort();
    state.renders.push((input.pts_ms, input_ids));
    let frames = state
      .scenes
      .iter()
      .map(|(output_id, resolution)| (output_id.clone(), solid_frame(*resolution, 0)))
      .collect();
    Ok(OutputFrameSet {
      pts_ms: input.pts_ms,
      frames,
    })
  }

  fn update_scene(
    &mut self,
    output_id: &OutputId,
    resolution: Resolution,
    scene: serde_json::Value,
  ) -> RendererResult<()> {
    if scene.get("invalid").is_some() {
      return Err(RendererError::from("invalid scene"));
    }
    self.state.lock().unwrap().scenes.insert(output_id.clone(), resolution);
    Ok(())
  }

  fn register_input(&mut self, input_id: &InputId) {
    self.state.lock().unwrap().inputs.insert(input_id.clone());
  }

  fn unregister_input(&mut self, input_id: &InputId) {
    self.state.lock().unwrap().inputs.remove(input_id);
  }

  fn unregister_output(&mut self, output_id: &OutputId) {
    self.state.lock().unwrap().scenes.remove(output_id);
  }

  fn asset_loader(&self) -> Arc<dyn AssetLoader> {
    self.assets.clone()
  }

  fn register_image(&mut self, image_id: &str, _image: LoadedImage) -> RendererResult<()> {
    self.state.lock().unwrap().images.insert(image_id.to_string());
    Ok(())
  }

  fn unregister_image(&mut self, image_id: &str) -> RendererResult<()> {
    if !self.state.lock().unwrap().images.remove(image_id) {
      return Err(RendererError::from("unknown image"));
    }
    Ok(())
  }

  fn register_font(&mut self, font: Vec<u8>) -> RendererResult<()> {
    self.state.lock().unwrap().fonts.push(font);
    Ok(())
  }
}

impl RendererProbe {
  pub fn has_input(&self, input_id: &str) -> bool {
    self.state.lock().unwrap().inputs.contains(&InputId::from(input_id))
  }

  pub fn has_output(&self, output_id: &str) -> bool {
    self.state.lock().unwrap().scenes.contains_key(&OutputId::from(output_id))
  }

  /// Render frames for `output_id` without going through `update_scene`
  pub fn add_scene(&self, output_id: &str, resolution: Resolution) {
    self.state.lock().unwrap().scenes.insert(output_id.into(), resolution);
  }

  pub fn renders(&self) -> Vec<(f64, Vec<InputId>)> {
    self.state.lock().unwrap().renders.clone()
  }

  pub fn has_image(&self, image_id: &str) -> bool {
    self.state.lock().unwrap().images.contains(image_id)
  }

  pub fn font_count(&self) -> usize {
    self.state.lock().unwrap().fonts.len()
  }
}

pub fn shared_renderer() -> (SharedRenderer, RendererProbe) {
  let (renderer, probe) = RecordingRenderer::new();
  let renderer: Box<dyn Renderer> = Box::new(renderer);
  (Arc::new(tokio::sync::Mutex::new(renderer)), probe)
}

pub struct RecordingOutput {
  resolution: Resolution,
  frames: Counter,
}

impl RecordingOutput {
  pub fn new(resolution: Resolution) -> (Self, Counter) {
    let frames = Counter::default();
    (
      Self {
        resolution,
        frames: frames.clone(),
      },
      frames,
    )
  }
}

impl Output for RecordingOutput {
  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn send_frame(&mut self, _frame: Frame) {
    self.frames.increment();
  }
}

/// Input that always returns the same frame
pub struct StaticInput {
  input_id: InputId,
  frame: Option<Frame>,
  closed: AtomicBool,
  queue_start_time: Mutex<Option<Instant>>,
}

impl StaticInput {
  pub fn new(input_id: &str, frame: Option<Frame>) -> Arc<Self> {
    Arc::new(Self {
      input_id: input_id.into(),
      frame,
      closed: AtomicBool::new(false),
      queue_start_time: Mutex::new(None),
    })
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  pub fn queue_start_time(&self) -> Option<Instant> {
    *self.queue_start_time.lock().unwrap()
  }
}

#[async_trait]
impl Input for StaticInput {
  fn input_id(&self) -> &InputId {
    &self.input_id
  }

  fn start(&self) -> InputMetadata {
    InputMetadata::default()
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
  }

  fn update_queue_start_time(&self, queue_start: Instant) {
    *self.queue_start_time.lock().unwrap() = Some(queue_start);
  }

  async fn get_frame(&self, _current_queue_pts_ms: f64) -> Option<Frame> {
    self.frame.clone()
  }
}

/// Worker served by a task on the current runtime
pub fn worker_in_runtime() -> (
  mpsc::UnboundedSender<Request>,
  mpsc::UnboundedReceiver<FromWorker>,
  RendererProbe,
) {
  let (renderer, probe) = RecordingRenderer::new();
  let (request_tx, request_rx) = mpsc::unbounded_channel();
  let (response_tx, response_rx) = mpsc::unbounded_channel();
  let pipeline = Arc::new(
    Pipeline::new(
      Box::new(renderer),
      PipelineOptions::default(),
      event_sender(&response_tx),
    )
    .unwrap(),
  );
  tokio::spawn(run_worker(pipeline, request_rx, response_tx));
  (request_tx, response_rx, probe)
}
