//! WHIP sink: WebRTC egress negotiated over HTTP
//!
//! Negotiation is non-trickle. ICE candidates are gathered into the local
//! description (bounded by a timeout) before the offer is POSTed, and the
//! `201` answer is applied as the remote description. The resource URL from
//! the `Location` header is kept for teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::broadcast;
use url::Url;

use crate::audio::AudioMixer;
use crate::config::DEFAULT_STUN_SERVER;
use crate::error::{PipelineError, Result};
use crate::platform::{MediaStream, Platform, TrackHandle};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
  pub urls: Vec<String>,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
  MaxBundle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
  pub ice_servers: Vec<IceServer>,
  pub bundle_policy: BundlePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
  SendOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationPreference {
  MaintainResolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingPriority {
  High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtpEncoding {
  pub max_bitrate: Option<u32>,
  pub priority: EncodingPriority,
  pub network_priority: EncodingPriority,
  pub scale_resolution_down_by: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransceiverInit {
  pub direction: TransceiverDirection,
  pub send_encodings: Vec<RtpEncoding>,
  pub degradation_preference: Option<DegradationPreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
  New,
  Gathering,
  Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionEvent {
  NegotiationNeeded,
  IceGatheringStateChange(IceGatheringState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
  Offer,
  Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
  pub sdp_type: SdpType,
  pub sdp: String,
}

/// `RTCPeerConnection`
#[async_trait]
pub trait PeerConnection: Send + Sync {
  fn subscribe(&self) -> broadcast::Receiver<PeerConnectionEvent>;

  fn add_transceiver(&self, track: TrackHandle, init: TransceiverInit) -> Result<()>;

  async fn create_offer(&self) -> Result<SessionDescription>;

  async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

  /// Current local description, including the candidates gathered so far
  fn local_description(&self) -> Option<SessionDescription>;

  fn ice_gathering_state(&self) -> IceGatheringState;

  async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

  fn close(&self);
}

/// WHIP output request as sent by the embedder
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhipOptions {
  pub endpoint_url: String,
  #[serde(default)]
  pub bearer_token: Option<String>,
  #[serde(default)]
  pub ice_servers: Option<Vec<IceServer>>,
  #[serde(default)]
  pub max_bitrate: Option<u32>,
}

impl WhipOptions {
  fn rtc_configuration(&self) -> RtcConfiguration {
    let ice_servers = self.ice_servers.clone().unwrap_or_else(|| {
      vec![IceServer {
        urls: vec![DEFAULT_STUN_SERVER.to_string()],
        username: None,
        credential: None,
      }]
    });
    RtcConfiguration {
      ice_servers,
      bundle_policy: BundlePolicy::MaxBundle,
    }
  }
}

pub struct WhipOutput {
  pc: Arc<dyn PeerConnection>,
  client: reqwest::Client,
  resource_url: Url,
  bearer_token: Option<String>,
  stream: MediaStream,
  mixer: Option<AudioMixer>,
  terminated: bool,
}

impl WhipOutput {
  /// Negotiate a session sending the video tracks of `stream` and, if a
  /// mixer is given, its output track.
  ///
  /// On failure the peer connection is closed and local tracks are stopped.
  pub async fn connect(
    platform: &dyn Platform,
    options: WhipOptions,
    mut stream: MediaStream,
    mut mixer: Option<AudioMixer>,
    ice_gathering_timeout: Duration,
  ) -> Result<Self> {
    let (endpoint, pc) = match prepare(platform, &options) {
      Ok(prepared) => prepared,
      Err(err) => {
        release_local(&stream, mixer.as_mut());
        return Err(err);
      }
    };
    let client = reqwest::Client::new();

    if let Some(track) = mixer.as_ref().and_then(AudioMixer::output_track) {
      stream.add_track(track);
    }

    let negotiation = async {
      let mut events = pc.subscribe();
      add_transceivers(pc.as_ref(), &stream, options.max_bitrate)?;
      wait_for_negotiation_needed(&mut events).await?;
      establish(
        pc.as_ref(),
        &mut events,
        &client,
        &endpoint,
        options.bearer_token.as_deref(),
        ice_gathering_timeout,
      )
      .await
    };

    match negotiation.await {
      Ok(resource_url) => {
        tracing::debug!(target: "smelter", resource = %resource_url, "WHIP session established");
        Ok(Self {
          pc,
          client,
          resource_url,
          bearer_token: options.bearer_token,
          stream,
          mixer,
          terminated: false,
        })
      }
      Err(err) => {
        pc.close();
        release_local(&stream, mixer.as_mut());
        Err(err)
      }
    }
  }

  pub fn stream(&self) -> &MediaStream {
    &self.stream
  }

  pub fn resource_url(&self) -> &Url {
    &self.resource_url
  }

  pub fn mixer_mut(&mut self) -> Option<&mut AudioMixer> {
    self.mixer.as_mut()
  }

  /// DELETE the session resource, then release local resources whatever the
  /// DELETE outcome.
  pub async fn terminate(&mut self) {
    if self.terminated {
      return;
    }
    self.terminated = true;

    let mut request = self.client.delete(self.resource_url.clone());
    if let Some(token) = self.bearer_token.as_deref() {
      request = request.bearer_auth(token);
    }
    // Some services do not implement DELETE
    match request.send().await {
      Ok(response) if !response.status().is_success() => {
        tracing::debug!(target: "smelter", status = %response.status(), "WHIP DELETE rejected");
      }
      Ok(_) => {}
      Err(err) => tracing::debug!(target: "smelter", "WHIP DELETE failed: {}", err),
    }

    self.pc.close();
    self.stream.stop_all();
    if let Some(mixer) = self.mixer.as_mut() {
      mixer.close();
    }
  }
}

fn prepare(platform: &dyn Platform, options: &WhipOptions) -> Result<(Url, Arc<dyn PeerConnection>)> {
  let endpoint = Url::parse(&options.endpoint_url)?;
  let pc = platform.create_peer_connection(options.rtc_configuration())?;
  Ok((endpoint, pc))
}

/// Stop captured tracks and close the mixer of a session that never started
fn release_local(stream: &MediaStream, mixer: Option<&mut AudioMixer>) {
  stream.stop_all();
  if let Some(mixer) = mixer {
    mixer.close();
  }
}

fn add_transceivers(pc: &dyn PeerConnection, stream: &MediaStream, max_bitrate: Option<u32>) -> Result<()> {
  for track in stream.video_tracks() {
    pc.add_transceiver(
      track.clone(),
      TransceiverInit {
        direction: TransceiverDirection::SendOnly,
        send_encodings: vec![RtpEncoding {
          max_bitrate,
          priority: EncodingPriority::High,
          network_priority: EncodingPriority::High,
          scale_resolution_down_by: 1.0,
        }],
        degradation_preference: Some(DegradationPreference::MaintainResolution),
      },
    )?;
  }
  for track in stream.audio_tracks() {
    pc.add_transceiver(
      track.clone(),
      TransceiverInit {
        direction: TransceiverDirection::SendOnly,
        send_encodings: Vec::new(),
        degradation_preference: None,
      },
    )?;
  }
  Ok(())
}

async fn wait_for_negotiation_needed(events: &mut broadcast::Receiver<PeerConnectionEvent>) -> Result<()> {
  loop {
    match events.recv().await {
      Ok(PeerConnectionEvent::NegotiationNeeded) => return Ok(()),
      Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
      Err(broadcast::error::RecvError::Closed) => {
        return Err(PipelineError::PeerConnection(
          "peer connection closed before negotiation".to_string(),
        ));
      }
    }
  }
}

/// Best effort, returns once gathering completed or `timeout` elapsed
async fn wait_for_ice_gathering(
  pc: &dyn PeerConnection,
  events: &mut broadcast::Receiver<PeerConnectionEvent>,
  timeout: Duration,
) {
  let complete = async {
    loop {
      if pc.ice_gathering_state() == IceGatheringState::Complete {
        return;
      }
      match events.recv().await {
        Ok(PeerConnectionEvent::IceGatheringStateChange(IceGatheringState::Complete)) => return,
        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => return,
      }
    }
  };
  if tokio::time::timeout(timeout, complete).await.is_err() {
    tracing::debug!(target: "smelter", "ICE gathering timed out, sending offer with candidates gathered so far");
  }
}

async fn establish(
  pc: &dyn PeerConnection,
  events: &mut broadcast::Receiver<PeerConnectionEvent>,
  client: &reqwest::Client,
  endpoint: &Url,
  bearer_token: Option<&str>,
  ice_gathering_timeout: Duration,
) -> Result<Url> {
  let offer = pc.create_offer().await?;
  pc.set_local_description(offer).await?;

  wait_for_ice_gathering(pc, events, ice_gathering_timeout).await;
  let offer = pc.local_description().ok_or(PipelineError::IceGatheringFailed)?;

  let mut request = client
    .post(endpoint.clone())
    .header(CONTENT_TYPE, "application/sdp")
    .body(offer.sdp);
  if let Some(token) = bearer_token {
    request = request.bearer_auth(token);
  }
  let response = request.send().await?;

  if response.status() != StatusCode::CREATED {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    return Err(PipelineError::Whip { status, message });
  }

  // Missing when a CORS policy hides it, the endpoint doubles as the resource then
  let resource_url = match response.headers().get(LOCATION).and_then(|value| value.to_str().ok()) {
    Some(location) => endpoint.join(location)?,
    None => endpoint.clone(),
  };

  let answer = response.text().await?;
  pc.set_remote_description(SessionDescription {
    sdp_type: SdpType::Answer,
    sdp: answer,
  })
  .await?;

  Ok(resource_url)
}
