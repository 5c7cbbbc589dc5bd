//! Platform objects the pipeline drives but does not implement
//!
//! On the web these are `MediaStreamTrack`, `HTMLCanvasElement`,
//! `OffscreenCanvas`, `AudioContext` and `RTCPeerConnection`. The controller
//! creates them through [`Platform`]; the worker only ever sees objects that
//! were moved to it (offscreen canvases, track readers).

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::audio::{AudioDestination, AudioGraph};
use crate::error::Result;
use crate::output::whip::{PeerConnection, RtcConfiguration};
use crate::types::{Frame, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
  Audio,
  Video,
}

pub trait MediaTrack: Send + Sync {
  fn id(&self) -> String;

  fn kind(&self) -> TrackKind;

  fn stop(&self);

  /// Resolves once the track ended. Tracks that never end keep it pending.
  fn ended(&self) -> BoxFuture<'static, ()> {
    futures::future::pending().boxed()
  }
}

pub type TrackHandle = Arc<dyn MediaTrack>;

#[derive(Clone, Default)]
pub struct MediaStream {
  tracks: Vec<TrackHandle>,
}

impl MediaStream {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_track(&mut self, track: TrackHandle) {
    self.tracks.push(track);
  }

  pub fn tracks(&self) -> &[TrackHandle] {
    &self.tracks
  }

  pub fn video_tracks(&self) -> impl Iterator<Item = &TrackHandle> {
    self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
  }

  pub fn audio_tracks(&self) -> impl Iterator<Item = &TrackHandle> {
    self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
  }

  pub fn stop_all(&self) {
    for track in &self.tracks {
      track.stop();
    }
  }
}

impl std::fmt::Debug for MediaStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let ids: Vec<String> = self.tracks.iter().map(|t| t.id()).collect();
    f.debug_struct("MediaStream").field("tracks", &ids).finish()
  }
}

/// Canvas owned by the controller context
pub trait Canvas: Send {
  /// Capture the canvas content as a live video stream at a fixed rate
  fn capture_stream(&mut self, frames_per_second: f64) -> Result<MediaStream>;

  /// Move drawing control to an offscreen canvas that can be sent to the worker.
  ///
  /// Consumes the canvas: nothing may be drawn on it from this side afterwards.
  fn transfer_control_to_offscreen(self: Box<Self>) -> Box<dyn OffscreenCanvas>;
}

/// Drawing surface owned by the worker
pub trait OffscreenCanvas: Send {
  fn paint(&mut self, frame: &Frame) -> Result<()>;

  fn close(&mut self) {}
}

/// Factory for platform objects used by the controller
pub trait Platform: Send + Sync {
  fn create_canvas(&self, resolution: Resolution) -> Result<Box<dyn Canvas>>;

  fn create_peer_connection(&self, config: RtcConfiguration) -> Result<Arc<dyn PeerConnection>>;

  fn create_audio_graph(&self, destination: AudioDestination) -> Result<Box<dyn AudioGraph>>;
}
