//! Stream sink: a canvas captured as a `MediaStream`
//!
//! The capture rate is fixed at the pipeline framerate and is not tied to
//! actual tick cadence. The worker paints into the transferred offscreen
//! canvas; this side only owns the resulting tracks and the audio mix.

use crate::audio::AudioMixer;
use crate::error::Result;
use crate::platform::{Canvas, MediaStream, OffscreenCanvas};
use crate::types::Framerate;

pub struct StreamOutput {
  stream: MediaStream,
  mixer: Option<AudioMixer>,
  terminated: bool,
}

impl StreamOutput {
  /// Capture `canvas` and hand its drawing surface back for transfer to the worker.
  pub fn new(
    mut canvas: Box<dyn Canvas>,
    framerate: Framerate,
    mixer: Option<AudioMixer>,
  ) -> Result<(Self, Box<dyn OffscreenCanvas>)> {
    let mut stream = match canvas.capture_stream(framerate.frames_per_second()) {
      Ok(stream) => stream,
      Err(err) => {
        if let Some(mut mixer) = mixer {
          mixer.close();
        }
        return Err(err);
      }
    };
    if let Some(track) = mixer.as_ref().and_then(AudioMixer::output_track) {
      stream.add_track(track);
    }
    let offscreen = canvas.transfer_control_to_offscreen();
    Ok((
      Self {
        stream,
        mixer,
        terminated: false,
      },
      offscreen,
    ))
  }

  pub fn stream(&self) -> &MediaStream {
    &self.stream
  }

  pub fn mixer_mut(&mut self) -> Option<&mut AudioMixer> {
    self.mixer.as_mut()
  }

  pub fn terminate(&mut self) {
    if self.terminated {
      return;
    }
    self.terminated = true;
    self.stream.stop_all();
    if let Some(mixer) = self.mixer.as_mut() {
      mixer.close();
    }
  }
}
