//! Render engine abstraction.
//!
//! The runtime is the only writer of a [`RenderEngine`]. Engines are never
//! re-pointed at a new container: a container swap destroys the engine and
//! asks the [`EngineFactory`] for a fresh one, seeded with the captured
//! [`CameraState`].

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{FeatureCollection, LngLat};
use crate::layers::MountEntry;

/// The host element an engine renders into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Container {
    id: String,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Camera position. Carried across reattachment unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub center: LngLat,
    pub zoom: f64,
    /// Degrees clockwise from north.
    pub bearing: f64,
    /// Degrees from nadir.
    pub pitch: f64,
}

impl CameraState {
    pub fn new(center: LngLat, zoom: f64) -> Self {
        Self {
            center,
            zoom,
            bearing: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_bearing(mut self, bearing: f64) -> Self {
        self.bearing = bearing;
        self
    }

    pub fn with_pitch(mut self, pitch: f64) -> Self {
        self.pitch = pitch;
        self
    }
}

impl Default for CameraState {
    fn default() -> Self {
        Self::new(LngLat::new(0.0, 0.0), 2.0)
    }
}

/// Engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("container '{0}' is not available")]
    ContainerUnavailable(String),

    #[error("engine failed to load: {0}")]
    LoadFailed(String),

    #[error("layer '{layer}': {reason}")]
    Layer { layer: String, reason: String },

    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    #[error("frame error: {0}")]
    Frame(String),
}

/// A live render engine bound to one container.
///
/// Async methods return boxed futures so the trait stays dyn-compatible.
pub trait RenderEngine: Send {
    /// Container this engine renders into.
    fn container_id(&self) -> &str;

    /// Resolves once the engine's style and resources are loaded.
    fn wait_until_loaded(&mut self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Mount layers in the given order with their initial data.
    fn mount_layers(&mut self, layers: Vec<MountEntry>) -> BoxFuture<'_, Result<(), EngineError>>;

    fn set_layer_data(&mut self, layer_id: &str, data: &FeatureCollection) -> Result<(), EngineError>;

    fn set_visibility(&mut self, layer_id: &str, visible: bool) -> Result<(), EngineError>;

    fn camera(&self) -> CameraState;

    fn set_camera(&mut self, camera: CameraState) -> Result<(), EngineError>;

    /// Re-measure the container.
    fn resize(&mut self) -> Result<(), EngineError>;

    /// Start collecting layer changes for one frame.
    fn begin_frame(&mut self);

    /// Present every change since `begin_frame` at once.
    fn commit_frame(&mut self) -> Result<(), EngineError>;

    /// Release all engine resources.
    fn destroy(self: Box<Self>);
}

/// Builds engines bound to a container.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        container: &Container,
        camera: CameraState,
    ) -> BoxFuture<'static, Result<Box<dyn RenderEngine>, EngineError>>;
}
