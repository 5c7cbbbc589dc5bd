//! Lifecycle events pushed from the worker to the controller

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{InputId, OutputId};

/// Unsolicited lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
  VideoInputDelivered {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  VideoInputPlaying {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  VideoInputEos {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  AudioInputDelivered {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  AudioInputPlaying {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  AudioInputEos {
    #[serde(rename = "inputId")]
    input_id: InputId,
  },
  OutputDone {
    #[serde(rename = "outputId")]
    output_id: OutputId,
  },
}

/// Per-input lifecycle step, used to keep events ordered and unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InputLifecycle {
  Delivered,
  Playing,
  Eos,
}

impl WorkerEvent {
  pub fn video(input_id: &InputId, step: InputLifecycle) -> Self {
    let input_id = input_id.clone();
    match step {
      InputLifecycle::Delivered => WorkerEvent::VideoInputDelivered { input_id },
      InputLifecycle::Playing => WorkerEvent::VideoInputPlaying { input_id },
      InputLifecycle::Eos => WorkerEvent::VideoInputEos { input_id },
    }
  }

  pub fn audio(input_id: &InputId, step: InputLifecycle) -> Self {
    let input_id = input_id.clone();
    match step {
      InputLifecycle::Delivered => WorkerEvent::AudioInputDelivered { input_id },
      InputLifecycle::Playing => WorkerEvent::AudioInputPlaying { input_id },
      InputLifecycle::Eos => WorkerEvent::AudioInputEos { input_id },
    }
  }
}

/// Cloneable handle used by worker components to post events
#[derive(Clone)]
pub struct EventSender {
  post: Arc<dyn Fn(WorkerEvent) + Send + Sync>,
}

impl EventSender {
  pub fn new<F>(post: F) -> Self
  where
    F: Fn(WorkerEvent) + Send + Sync + 'static,
  {
    Self {
      post: Arc::new(post),
    }
  }

  /// Sender paired with a receiver, mostly for tests and local wiring
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = Self::new(move |event| {
      if tx.send(event).is_err() {
        tracing::debug!(target: "smelter", "Event receiver dropped, event discarded");
      }
    });
    (sender, rx)
  }

  pub fn send(&self, event: WorkerEvent) {
    tracing::debug!(target: "smelter", ?event, "Posting event");
    (self.post)(event);
  }
}

impl std::fmt::Debug for EventSender {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventSender").finish_non_exhaustive()
  }
}

/// Guards the `delivered -> playing -> eos` ordering for one input.
///
/// Each step fires at most once and only after every earlier step fired.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
  last: Option<InputLifecycle>,
}

impl LifecycleTracker {
  /// Returns true if `step` should be emitted now
  pub fn advance(&mut self, step: InputLifecycle) -> bool {
    let expected = match self.last {
      None => InputLifecycle::Delivered,
      Some(InputLifecycle::Delivered) => InputLifecycle::Playing,
      Some(InputLifecycle::Playing) => InputLifecycle::Eos,
      Some(InputLifecycle::Eos) => return false,
    };
    if step != expected {
      return false;
    }
    self.last = Some(step);
    true
  }

  pub fn last(&self) -> Option<InputLifecycle> {
    self.last
  }
}
