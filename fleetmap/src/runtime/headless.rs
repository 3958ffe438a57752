//! In-process render engine.
//!
//! Keeps layer data in memory and records frames instead of drawing. Used by
//! the CLI and by tests; the factory's [`EngineProbe`] counts live instances
//! so the single-engine invariant can be observed from outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use super::engine::{CameraState, Container, EngineError, EngineFactory, RenderEngine};
use crate::geo::FeatureCollection;
use crate::layers::MountEntry;

/// Live/created engine counters shared between a factory and its engines.
#[derive(Debug, Clone, Default)]
pub struct EngineProbe {
    live: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    last_mount: Arc<Mutex<Vec<(String, usize)>>>,
    visibility: Arc<Mutex<HashMap<String, bool>>>,
}

impl EngineProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Engines created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Highest number of engines alive at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Layer ids and feature counts of the most recent successful mount.
    pub fn last_mount(&self) -> Vec<(String, usize)> {
        self.last_mount.lock().clone()
    }

    /// Visibility of a layer on the most recently mounted engine.
    pub fn visible(&self, layer_id: &str) -> Option<bool> {
        self.visibility.lock().get(layer_id).copied()
    }

    fn on_create(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn on_drop(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Failure and latency injection for headless engines.
///
/// Shared with every engine of a factory, so changes apply to live engines.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBehavior {
    pub create_delay: Duration,
    pub load_delay: Duration,
    pub mount_delay: Duration,
    /// Blocks inside `commit_frame`, to exercise the flush budget.
    pub commit_delay: Duration,
    pub fail_load: bool,
    pub fail_mount: bool,
}

/// Recording engine.
#[derive(Debug)]
pub struct HeadlessEngine {
    container_id: String,
    camera: CameraState,
    behavior: Arc<Mutex<HeadlessBehavior>>,
    mounted: Vec<String>,
    visibility: HashMap<String, bool>,
    data: HashMap<String, FeatureCollection>,
    staged: Option<HashMap<String, FeatureCollection>>,
    frames: usize,
    resizes: usize,
    probe: EngineProbe,
}

impl HeadlessEngine {
    pub fn new(container_id: impl Into<String>, camera: CameraState) -> Self {
        Self::with_probe(container_id, camera, Arc::default(), EngineProbe::new())
    }

    fn with_probe(
        container_id: impl Into<String>,
        camera: CameraState,
        behavior: Arc<Mutex<HeadlessBehavior>>,
        probe: EngineProbe,
    ) -> Self {
        probe.on_create();
        Self {
            container_id: container_id.into(),
            camera,
            behavior,
            mounted: Vec::new(),
            visibility: HashMap::new(),
            data: HashMap::new(),
            staged: None,
            frames: 0,
            resizes: 0,
            probe,
        }
    }

    /// Committed data for a layer.
    pub fn layer_data(&self, layer_id: &str) -> Option<&FeatureCollection> {
        self.data.get(layer_id)
    }

    /// Mounted layer ids in mount order.
    pub fn mounted_layers(&self) -> &[String] {
        &self.mounted
    }

    pub fn is_visible(&self, layer_id: &str) -> Option<bool> {
        self.visibility.get(layer_id).copied()
    }

    pub fn frames_committed(&self) -> usize {
        self.frames
    }

    pub fn resize_count(&self) -> usize {
        self.resizes
    }

    fn check_layer(&self, layer_id: &str) -> Result<(), EngineError> {
        if self.mounted.iter().any(|id| id == layer_id) {
            Ok(())
        } else {
            Err(EngineError::UnknownLayer(layer_id.to_string()))
        }
    }
}

impl Drop for HeadlessEngine {
    fn drop(&mut self) {
        self.probe.on_drop();
    }
}

impl RenderEngine for HeadlessEngine {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn wait_until_loaded(&mut self) -> BoxFuture<'_, Result<(), EngineError>> {
        let (delay, fail) = {
            let behavior = self.behavior.lock();
            (behavior.load_delay, behavior.fail_load)
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(EngineError::LoadFailed("style unavailable".to_string()));
            }
            Ok(())
        })
    }

    fn mount_layers(&mut self, layers: Vec<MountEntry>) -> BoxFuture<'_, Result<(), EngineError>> {
        let (delay, fail) = {
            let behavior = self.behavior.lock();
            (behavior.mount_delay, behavior.fail_mount)
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                let layer = layers.first().map(|l| l.spec.id.clone()).unwrap_or_default();
                return Err(EngineError::Layer {
                    layer,
                    reason: "source rejected".to_string(),
                });
            }
            let mut record = Vec::with_capacity(layers.len());
            let mut shown = HashMap::with_capacity(layers.len());
            for entry in layers {
                shown.insert(entry.spec.id.clone(), entry.visible);
                record.push((entry.spec.id.clone(), entry.data.len()));
                self.visibility.insert(entry.spec.id.clone(), entry.visible);
                self.data.insert(entry.spec.id.clone(), entry.data);
                self.mounted.push(entry.spec.id);
            }
            *self.probe.visibility.lock() = shown;
            *self.probe.last_mount.lock() = record;
            Ok(())
        })
    }

    fn set_layer_data(&mut self, layer_id: &str, data: &FeatureCollection) -> Result<(), EngineError> {
        self.check_layer(layer_id)?;
        match self.staged.as_mut() {
            Some(staged) => {
                staged.insert(layer_id.to_string(), data.clone());
            }
            None => {
                self.data.insert(layer_id.to_string(), data.clone());
            }
        }
        Ok(())
    }

    fn set_visibility(&mut self, layer_id: &str, visible: bool) -> Result<(), EngineError> {
        self.check_layer(layer_id)?;
        self.visibility.insert(layer_id.to_string(), visible);
        self.probe
            .visibility
            .lock()
            .insert(layer_id.to_string(), visible);
        Ok(())
    }

    fn camera(&self) -> CameraState {
        self.camera
    }

    fn set_camera(&mut self, camera: CameraState) -> Result<(), EngineError> {
        self.camera = camera;
        Ok(())
    }

    fn resize(&mut self) -> Result<(), EngineError> {
        self.resizes += 1;
        Ok(())
    }

    fn begin_frame(&mut self) {
        self.staged = Some(HashMap::new());
    }

    fn commit_frame(&mut self) -> Result<(), EngineError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| EngineError::Frame("commit without begin".to_string()))?;
        let delay = self.behavior.lock().commit_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.data.extend(staged);
        self.frames += 1;
        Ok(())
    }

    fn destroy(self: Box<Self>) {
        debug!(container = %self.container_id, frames = self.frames, "Headless engine destroyed");
    }
}

/// Factory for [`HeadlessEngine`]s.
///
/// Behavior can be changed at any time with [`set_behavior`](Self::set_behavior).
#[derive(Debug, Clone, Default)]
pub struct HeadlessEngineFactory {
    probe: EngineProbe,
    behavior: Arc<Mutex<HeadlessBehavior>>,
}

impl HeadlessEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: HeadlessBehavior) -> Self {
        Self {
            probe: EngineProbe::new(),
            behavior: Arc::new(Mutex::new(behavior)),
        }
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    pub fn set_behavior(&self, behavior: HeadlessBehavior) {
        *self.behavior.lock() = behavior;
    }
}

impl EngineFactory for HeadlessEngineFactory {
    fn create(
        &self,
        container: &Container,
        camera: CameraState,
    ) -> BoxFuture<'static, Result<Box<dyn RenderEngine>, EngineError>> {
        let behavior = Arc::clone(&self.behavior);
        let delay = behavior.lock().create_delay;
        let probe = self.probe.clone();
        let container_id = container.id().to_string();

        Box::pin(async move {
            if container_id.is_empty() {
                return Err(EngineError::ContainerUnavailable(container_id));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(container = %container_id, "Headless engine created");
            let engine: Box<dyn RenderEngine> =
                Box::new(HeadlessEngine::with_probe(container_id, camera, behavior, probe));
            Ok(engine)
        })
    }
}
