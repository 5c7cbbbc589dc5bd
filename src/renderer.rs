//! Renderer boundary
//!
//! The compositing engine is opaque to the pipeline. It receives the frames
//! sampled from inputs on every tick and returns one frame per registered
//! output. Scenes, images and fonts are registered through the same trait.
//!
//! Images and fonts are fetched by an [`AssetLoader`] first, without access to
//! the renderer, so downloads never hold up rendering. Only the final
//! registration of the loaded bytes touches renderer state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{InputFrameSet, InputId, OutputFrameSet, OutputId, Resolution};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RendererError(pub String);

impl From<&str> for RendererError {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

pub type RendererResult<T> = std::result::Result<T, RendererError>;

/// Image bytes together with the spec they were loaded from
#[derive(Debug, Clone)]
pub struct LoadedImage {
  pub spec: serde_json::Value,
  pub data: Vec<u8>,
}

/// Network and decode half of asset registration
#[async_trait]
pub trait AssetLoader: Send + Sync {
  async fn load_image(&self, image_id: &str, spec: serde_json::Value) -> RendererResult<LoadedImage>;

  async fn load_font(&self, url: &str) -> RendererResult<Vec<u8>>;
}

#[async_trait]
pub trait Renderer: Send {
  async fn render(&mut self, input: InputFrameSet) -> RendererResult<OutputFrameSet>;

  /// Replace the scene of an output. Implicitly registers unknown outputs.
  fn update_scene(
    &mut self,
    output_id: &OutputId,
    resolution: Resolution,
    scene: serde_json::Value,
  ) -> RendererResult<()>;

  fn register_input(&mut self, input_id: &InputId);

  fn unregister_input(&mut self, input_id: &InputId);

  fn unregister_output(&mut self, output_id: &OutputId);

  /// Loader used for images and fonts. Called once, when the worker is created.
  fn asset_loader(&self) -> Arc<dyn AssetLoader>;

  fn register_image(&mut self, image_id: &str, image: LoadedImage) -> RendererResult<()>;

  fn unregister_image(&mut self, image_id: &str) -> RendererResult<()>;

  fn register_font(&mut self, font: Vec<u8>) -> RendererResult<()>;
}
