//! AudioMixer - per-output audio graph
//!
//! Each connected input is wired as `track source -> gain -> destination`.
//! The graph itself (Web Audio `AudioContext` on the web) is reached through
//! [`AudioGraph`] and addressed by opaque node ids.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::platform::TrackHandle;
use crate::types::InputId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Where the mixed audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDestination {
  /// A `MediaStream` track consumed by a stream or WHIP output
  Stream,
  /// Local playback device
  Device,
}

pub trait AudioGraph: Send {
  fn destination(&self) -> NodeId;

  fn create_track_source(&mut self, track: &TrackHandle) -> Result<NodeId>;

  fn create_gain(&mut self) -> Result<NodeId>;

  /// Source producing silence forever
  fn create_silent_source(&mut self) -> Result<NodeId>;

  fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()>;

  /// Disconnect every outgoing connection of `node`
  fn disconnect(&mut self, node: NodeId);

  fn set_gain(&mut self, node: NodeId, gain: f32);

  /// Track carrying the mixed audio. Only stream destinations have one.
  fn output_track(&self) -> Option<TrackHandle>;

  fn close(&mut self);
}

/// Volume of one input in an output mix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAudioConfig {
  pub input_id: InputId,
  /// In `[0, 1]`
  #[serde(default = "default_volume")]
  pub volume: f32,
}

fn default_volume() -> f32 {
  1.0
}

/// Audio part of an output scene
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioMixConfig {
  #[serde(default)]
  pub inputs: Vec<InputAudioConfig>,
}

impl AudioMixConfig {
  /// Volume for `input_id`. Inputs missing from the config are muted.
  pub fn volume(&self, input_id: &InputId) -> f32 {
    self
      .inputs
      .iter()
      .find(|config| &config.input_id == input_id)
      .map(|config| config.volume.clamp(0.0, 1.0))
      .unwrap_or(0.0)
  }
}

struct MixerInput {
  source: NodeId,
  gain: NodeId,
}

pub struct AudioMixer {
  graph: Box<dyn AudioGraph>,
  destination: AudioDestination,
  inputs: HashMap<InputId, MixerInput>,
  config: AudioMixConfig,
  silence: Option<NodeId>,
}

impl AudioMixer {
  pub fn new(mut graph: Box<dyn AudioGraph>, destination: AudioDestination) -> Result<Self> {
    let silence = match destination {
      AudioDestination::Stream => {
        // Keeps the output track producing samples with zero inputs
        let silence = graph.create_silent_source()?;
        let destination = graph.destination();
        graph.connect(silence, destination)?;
        Some(silence)
      }
      AudioDestination::Device => None,
    };
    Ok(Self {
      graph,
      destination,
      inputs: HashMap::new(),
      config: AudioMixConfig::default(),
      silence,
    })
  }

  pub fn destination(&self) -> AudioDestination {
    self.destination
  }

  pub fn output_track(&self) -> Option<TrackHandle> {
    self.graph.output_track()
  }

  pub fn has_input(&self, input_id: &InputId) -> bool {
    self.inputs.contains_key(input_id)
  }

  /// Connect a track. Its volume comes from the last applied config.
  pub fn add_input(&mut self, input_id: &InputId, track: &TrackHandle) -> Result<()> {
    self.remove_input(input_id);

    let source = self.graph.create_track_source(track)?;
    let gain = self.graph.create_gain()?;
    let destination = self.graph.destination();
    self.graph.connect(source, gain)?;
    self.graph.connect(gain, destination)?;
    self.graph.set_gain(gain, self.config.volume(input_id));

    self.inputs.insert(input_id.clone(), MixerInput { source, gain });
    tracing::debug!(target: "smelter", input_id = %input_id, "Audio input connected");
    Ok(())
  }

  pub fn remove_input(&mut self, input_id: &InputId) {
    if let Some(input) = self.inputs.remove(input_id) {
      self.graph.disconnect(input.source);
      self.graph.disconnect(input.gain);
    }
  }

  /// Connect listed tracks not yet mixed and disconnect inputs no longer listed.
  /// Inputs already connected keep their nodes.
  pub fn sync_inputs(&mut self, tracks: &[(InputId, TrackHandle)]) {
    let stale: Vec<InputId> = self
      .inputs
      .keys()
      .filter(|input_id| !tracks.iter().any(|(listed, _)| listed == *input_id))
      .cloned()
      .collect();
    for input_id in stale {
      self.remove_input(&input_id);
    }
    for (input_id, track) in tracks {
      if self.has_input(input_id) {
        continue;
      }
      if let Err(err) = self.add_input(input_id, track) {
        tracing::warn!(target: "smelter", input_id = %input_id, "Failed to connect audio: {}", err);
      }
    }
  }

  pub fn update(&mut self, config: AudioMixConfig) {
    for (input_id, input) in &self.inputs {
      self.graph.set_gain(input.gain, config.volume(input_id));
    }
    self.config = config;
  }

  pub fn close(&mut self) {
    let input_ids: Vec<InputId> = self.inputs.keys().cloned().collect();
    for input_id in input_ids {
      self.remove_input(&input_id);
    }
    if let Some(silence) = self.silence.take() {
      self.graph.disconnect(silence);
    }
    self.graph.close();
  }
}

impl std::fmt::Debug for AudioMixer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AudioMixer")
      .field("destination", &self.destination)
      .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
      .finish()
  }
}
