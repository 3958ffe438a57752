//! The map runtime.
//!
//! # Locking
//!
//! Synchronous state lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Engine construction (init and every reattachment) is
//! serialized by an async gate so at most one engine exists at a time. While
//! an engine is being built it is owned by the building task, not by the
//! shared state; only a fully mounted engine is installed.
//!
//! # Superseding
//!
//! Every init/attach request gets a fresh [`CancellationToken`] and cancels
//! the previous one. A cancelled request destroys whatever it built and
//! returns [`RuntimeError::Superseded`]; the newest request always wins.
//!
//! Handler callbacks run after the state lock is released.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diagnostics::RuntimeDiagnostics;
use super::engine::{CameraState, Container, EngineError, EngineFactory, RenderEngine};
use super::mode::{MapMode, ModeViolation};
use super::state::{
    Phase, PhaseTimeouts, RuntimeState, StateMachine, TransitionError, TransitionRecord,
    DEFAULT_HISTORY_CAPACITY,
};
use crate::entities::UpdateBatch;
use crate::geo::FeatureCollection;
use crate::layers::{default_layer_specs, FlushReport, LayerRegistry, LayerSpec, DEFAULT_MAX_QUEUE_LEN};
use crate::platform::ControlSignal;

/// Default interval of the background flush loop.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings fixed at init.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub timeouts: PhaseTimeouts,
    pub history_capacity: usize,
    pub max_queue_len: usize,
    pub layers: Vec<LayerSpec>,
    pub initial_camera: CameraState,
    pub frame_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeouts: PhaseTimeouts::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            layers: default_layer_specs(),
            initial_camera: CameraState::default(),
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl RuntimeConfig {
    pub fn with_timeouts(mut self, timeouts: PhaseTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_max_queue_len(mut self, max_queue_len: usize) -> Self {
        self.max_queue_len = max_queue_len;
        self
    }

    pub fn with_layers(mut self, layers: Vec<LayerSpec>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_initial_camera(mut self, camera: CameraState) -> Self {
        self.initial_camera = camera;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Runtime command failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    InvalidStateTransition(#[from] TransitionError),

    #[error("{phase} exceeded its {budget:?} budget")]
    InitializationTimeout { phase: Phase, budget: Duration },

    #[error("reattachment to '{container}' failed: {reason}")]
    ReattachmentFailure { container: String, reason: String },

    #[error("mode contract violation: {0}")]
    ModeContractViolation(#[from] ModeViolation),

    #[error("flush took {elapsed:?}, budget {budget:?}")]
    FlushOverrun { elapsed: Duration, budget: Duration },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    #[error("runtime not initialized")]
    NotInitialized,

    #[error("runtime destroyed")]
    Destroyed,

    #[error("superseded by a newer attach request")]
    Superseded,
}

// =============================================================================
// Handlers and sinks
// =============================================================================

/// Host callbacks. All methods default to no-ops.
pub trait RuntimeHandlers: Send + Sync {
    fn on_state_change(&self, _record: &TransitionRecord) {}

    fn on_degraded(&self, _error: &RuntimeError) {}

    fn on_ready(&self) {}

    fn on_control_signal(&self, _signal: &ControlSignal) {}
}

/// Handlers that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandlers;

impl RuntimeHandlers for NoopHandlers {}

/// Destination for update batches.
pub trait UpdateSink: Send + Sync {
    /// Submit a batch; returns the number of queue entries created.
    fn submit(&self, batch: UpdateBatch) -> Result<usize, RuntimeError>;
}

enum Notice {
    Transition(TransitionRecord),
    Degraded(RuntimeError),
    Ready,
    Signal(ControlSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Establish {
    Initial,
    Reattach,
}

// =============================================================================
// Inner state
// =============================================================================

struct RuntimeInner {
    config: RuntimeConfig,
    machine: StateMachine,
    engine: Option<Box<dyn RenderEngine>>,
    container: Option<Container>,
    camera: CameraState,
    registry: LayerRegistry,
    mode: MapMode,
    handlers: Arc<dyn RuntimeHandlers>,
    last_error: Option<String>,
    active_request: Option<CancellationToken>,
    generation: u64,
    constructing: bool,
    degraded_by_flush: bool,
    flush_count: u64,
    flush_overruns: u64,
    mode_violations: u64,
}

impl RuntimeInner {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            machine: StateMachine::new(config.history_capacity),
            registry: LayerRegistry::with_specs(config.layers.clone(), config.max_queue_len),
            camera: config.initial_camera,
            config,
            engine: None,
            container: None,
            mode: MapMode::default(),
            handlers: Arc::new(NoopHandlers),
            last_error: None,
            active_request: None,
            generation: 0,
            constructing: false,
            degraded_by_flush: false,
            flush_count: 0,
            flush_overruns: 0,
            mode_violations: 0,
        }
    }

    fn state(&self) -> RuntimeState {
        self.machine.state()
    }

    /// Apply a config before the first initialization.
    fn reconfigure(&mut self, config: RuntimeConfig) {
        self.machine = StateMachine::new(config.history_capacity);
        self.registry = LayerRegistry::with_specs(config.layers.clone(), config.max_queue_len);
        self.camera = config.initial_camera;
        self.config = config;
    }

    fn transition(
        &mut self,
        to: RuntimeState,
        reason: Option<&str>,
        notices: &mut Vec<Notice>,
    ) -> Result<(), TransitionError> {
        let record = self.machine.transition(to, reason)?;
        notices.push(Notice::Transition(record));
        Ok(())
    }

    fn degrade(&mut self, error: RuntimeError, notices: &mut Vec<Notice>) {
        let reason = error.to_string();
        self.last_error = Some(reason.clone());
        if self.state() != RuntimeState::Degraded {
            if let Err(e) = self.transition(RuntimeState::Degraded, Some(&reason), notices) {
                debug!(error = %e, "Could not enter degraded state");
            }
        }
        notices.push(Notice::Degraded(error));
    }

    fn fail(&mut self, error: &RuntimeError, notices: &mut Vec<Notice>) {
        let reason = error.to_string();
        self.last_error = Some(reason.clone());
        if let Err(e) = self.transition(RuntimeState::Error, Some(&reason), notices) {
            debug!(error = %e, "Could not enter error state");
        }
    }

    /// Start a new construction request, superseding any in flight.
    fn begin_request(&mut self) -> (CancellationToken, u64) {
        self.cancel_request();
        let token = CancellationToken::new();
        self.active_request = Some(token.clone());
        self.constructing = true;
        (token, self.generation)
    }

    fn cancel_request(&mut self) {
        if let Some(token) = self.active_request.take() {
            token.cancel();
        }
        self.generation += 1;
        self.constructing = false;
    }

    /// Apply visibility changes made after `mounted` was captured.
    fn sync_visibility(
        &self,
        engine: &mut dyn RenderEngine,
        mounted: &[(String, bool)],
    ) -> Result<(), EngineError> {
        for (layer_id, was_visible) in mounted {
            if let Some(handle) = self.registry.handle(layer_id) {
                if handle.visible != *was_visible {
                    engine.set_visibility(layer_id, handle.visible)?;
                }
            }
        }
        Ok(())
    }

    /// Destroy the current engine, keeping its camera.
    fn teardown_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.camera = engine.camera();
            debug!(container = engine.container_id(), "Tearing down engine");
            engine.destroy();
        }
    }

    fn flush(&mut self, notices: &mut Vec<Notice>) -> Result<FlushReport, RuntimeError> {
        match self.state() {
            RuntimeState::Destroyed => return Err(RuntimeError::Destroyed),
            RuntimeState::Uninitialized => return Ok(FlushReport::default()),
            _ => {}
        }
        // A fresh engine picks queued entries up when it is installed.
        if self.engine.is_none() && self.constructing {
            return Ok(FlushReport::default());
        }

        let started = std::time::Instant::now();
        let result = self.registry.flush(self.engine.as_deref_mut());
        let elapsed = started.elapsed();
        self.flush_count += 1;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                let error = RuntimeError::Engine(e);
                self.degrade(error.clone(), notices);
                return Err(error);
            }
        };

        if report.rendered {
            let budget = self.config.timeouts.flush;
            if elapsed > budget {
                self.flush_overruns += 1;
                warn!(?elapsed, ?budget, layers = report.layers.len(), "Flush over budget");
                if self.state() == RuntimeState::Ready {
                    self.degraded_by_flush = true;
                    self.degrade(RuntimeError::FlushOverrun { elapsed, budget }, notices);
                }
            } else if self.state() == RuntimeState::Degraded && self.degraded_by_flush {
                self.degraded_by_flush = false;
                if self
                    .transition(RuntimeState::Ready, Some("flush within budget"), notices)
                    .is_ok()
                {
                    notices.push(Notice::Ready);
                }
            }
        }

        Ok(report)
    }
}

// =============================================================================
// MapRuntime
// =============================================================================

static GLOBAL: OnceLock<Arc<MapRuntime>> = OnceLock::new();

/// Owner of the render engine and everything drawn on it.
pub struct MapRuntime {
    inner: Mutex<RuntimeInner>,
    gate: tokio::sync::Mutex<()>,
    factory: Arc<dyn EngineFactory>,
}

impl MapRuntime {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Mutex::new(RuntimeInner::new(RuntimeConfig::default())),
            gate: tokio::sync::Mutex::new(()),
            factory,
        }
    }

    /// Install the process-wide runtime. The first call wins; later calls
    /// return the existing instance and drop their factory.
    pub fn install_global(factory: Arc<dyn EngineFactory>) -> Arc<MapRuntime> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MapRuntime::new(factory))))
    }

    /// The process-wide runtime, if installed.
    pub fn global() -> Option<Arc<MapRuntime>> {
        GLOBAL.get().cloned()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut RuntimeInner, &mut Vec<Notice>) -> R) -> R {
        let mut notices = Vec::new();
        let (result, handlers) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner, &mut notices);
            (result, Arc::clone(&inner.handlers))
        };
        for notice in notices {
            match notice {
                Notice::Transition(record) => handlers.on_state_change(&record),
                Notice::Degraded(error) => handlers.on_degraded(&error),
                Notice::Ready => handlers.on_ready(),
                Notice::Signal(signal) => handlers.on_control_signal(&signal),
            }
        }
        result
    }

    // ===== Lifecycle =====

    /// Initialize against a container.
    ///
    /// Idempotent: once initialized this performs a reattachment instead. A
    /// runtime in `ERROR` retries a full initialization. Timeouts and engine
    /// failures are reported through the state machine as well as the
    /// returned error.
    pub async fn init(
        &self,
        container: Container,
        config: RuntimeConfig,
        handlers: Arc<dyn RuntimeHandlers>,
    ) -> Result<(), RuntimeError> {
        let request = self.with_inner(|inner, _| match inner.state() {
            RuntimeState::Destroyed => Err(RuntimeError::Destroyed),
            RuntimeState::Uninitialized => {
                inner.reconfigure(config);
                inner.handlers = handlers;
                Ok(Some(inner.begin_request()))
            }
            RuntimeState::Error => {
                inner.handlers = handlers;
                Ok(Some(inner.begin_request()))
            }
            _ => {
                inner.handlers = handlers;
                Ok(None)
            }
        })?;

        match request {
            Some((token, generation)) => {
                info!(container = %container, "Initializing map runtime");
                self.establish(container, Establish::Initial, token, generation)
                    .await
            }
            None => {
                debug!(container = %container, "Already initialized, reattaching");
                self.attach(container).await
            }
        }
    }

    /// Move the map to a new container.
    ///
    /// Captures the camera, destroys the old engine, builds a new one with
    /// the same camera and re-mounts every layer with its last-known data.
    /// A failure leaves the runtime `DEGRADED`. A newer request supersedes
    /// this one.
    pub async fn attach(&self, container: Container) -> Result<(), RuntimeError> {
        let (token, generation) = self.with_inner(|inner, _| match inner.state() {
            RuntimeState::Destroyed => Err(RuntimeError::Destroyed),
            RuntimeState::Uninitialized => Err(RuntimeError::NotInitialized),
            _ => Ok(inner.begin_request()),
        })?;
        info!(container = %container, "Attaching map runtime");
        self.establish(container, Establish::Reattach, token, generation)
            .await
    }

    /// Release the container (page navigation). Layer data and queued
    /// updates are kept for the next attach.
    pub fn detach(&self) -> Result<(), RuntimeError> {
        self.with_inner(|inner, notices| match inner.state() {
            RuntimeState::Destroyed => Err(RuntimeError::Destroyed),
            RuntimeState::Uninitialized => Ok(()),
            RuntimeState::Detached => {
                inner.cancel_request();
                Ok(())
            }
            _ => {
                inner.cancel_request();
                inner.teardown_engine();
                inner.container = None;
                inner.transition(RuntimeState::Detached, Some("detach"), notices)?;
                Ok(())
            }
        })
    }

    /// Tear everything down. Idempotent.
    pub fn destroy(&self) {
        self.with_inner(|inner, notices| {
            if inner.state() == RuntimeState::Destroyed {
                return;
            }
            inner.cancel_request();
            inner.teardown_engine();
            inner.container = None;
            let cleared = inner.registry.clear_queues();
            if let Err(e) = inner.transition(RuntimeState::Destroyed, Some("destroy"), notices) {
                warn!(error = %e, "Destroy transition rejected");
            }
            info!(cleared, "Map runtime destroyed");
        });
    }

    async fn establish(
        &self,
        container: Container,
        kind: Establish,
        token: CancellationToken,
        generation: u64,
    ) -> Result<(), RuntimeError> {
        let result = self.establish_inner(&container, kind, &token).await;

        self.with_inner(|inner, _| {
            if inner.generation == generation {
                inner.active_request = None;
                inner.constructing = false;
            }
        });

        match &result {
            Err(RuntimeError::Superseded) => {
                debug!(container = %container, "Attach request superseded")
            }
            Err(e) => warn!(container = %container, error = %e, "Map runtime not ready"),
            Ok(()) => {}
        }
        result
    }

    async fn establish_inner(
        &self,
        container: &Container,
        kind: Establish,
        token: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let _gate = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RuntimeError::Superseded),
            guard = self.gate.lock() => guard,
        };

        // Step 1: tear down and enter the construction phase.
        let (camera, timeouts) = self.with_inner(|inner, notices| {
            if token.is_cancelled() {
                return Err(RuntimeError::Superseded);
            }
            if inner.state() == RuntimeState::Destroyed {
                return Err(RuntimeError::Destroyed);
            }
            inner.teardown_engine();
            inner.container = Some(container.clone());
            match kind {
                Establish::Initial => {
                    inner.transition(RuntimeState::Initializing, Some("init"), notices)?;
                }
                Establish::Reattach => {
                    if inner.state() != RuntimeState::Detached {
                        inner.transition(RuntimeState::Detached, Some("container swap"), notices)?;
                    }
                    inner.transition(RuntimeState::LoadingLayers, Some("reattach"), notices)?;
                }
            }
            Ok((inner.camera, inner.config.timeouts))
        })?;

        // Step 2: create and load under the init budget.
        let deadline = tokio::time::Instant::now() + timeouts.init;
        let created = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RuntimeError::Superseded),
            result = tokio::time::timeout_at(deadline, self.create_loaded(container, camera)) => result,
        };
        let mut engine = match created {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => return Err(self.construction_failed(kind, container, e.into())),
            Err(_) => {
                let error = RuntimeError::InitializationTimeout {
                    phase: Phase::Init,
                    budget: timeouts.init,
                };
                return Err(self.construction_failed(kind, container, error));
            }
        };

        if kind == Establish::Initial {
            let advanced = self.with_inner(|inner, notices| {
                inner.transition(RuntimeState::LoadingLayers, None, notices)
            });
            if let Err(e) = advanced {
                engine.destroy();
                return Err(e.into());
            }
        }

        // Step 3: mount layers with their last-known data.
        let entries = self.with_inner(|inner, _| inner.registry.mount_entries());
        let mounted: Vec<(String, bool)> = entries
            .iter()
            .map(|e| (e.spec.id.clone(), e.visible))
            .collect();
        let mount_result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeouts.layer_mount, engine.mount_layers(entries)) => Some(result),
        };
        let mut failure = match mount_result {
            None => {
                engine.destroy();
                return Err(RuntimeError::Superseded);
            }
            Some(Ok(Ok(()))) => None,
            Some(Ok(Err(e))) => Some(RuntimeError::Engine(e)),
            Some(Err(_)) => Some(RuntimeError::InitializationTimeout {
                phase: Phase::LayerMount,
                budget: timeouts.layer_mount,
            }),
        };
        if failure.is_none() {
            if let Err(e) = engine.resize() {
                failure = Some(RuntimeError::Engine(e));
            }
        }

        // Step 4: install.
        self.with_inner(|inner, notices| {
            if token.is_cancelled() {
                engine.destroy();
                return Err(RuntimeError::Superseded);
            }
            if inner.state() == RuntimeState::Destroyed {
                engine.destroy();
                return Err(RuntimeError::Destroyed);
            }

            // Camera and visibility may have moved while the engine was built.
            let mut failure = failure;
            if inner.camera != camera {
                if let Err(e) = engine.set_camera(inner.camera) {
                    failure = failure.or(Some(RuntimeError::Engine(e)));
                }
            }
            if failure.is_none() {
                if let Err(e) = inner.sync_visibility(engine.as_mut(), &mounted) {
                    failure = Some(RuntimeError::Engine(e));
                }
            }

            inner.engine = Some(engine);

            if let Some(error) = failure {
                let error = match kind {
                    Establish::Initial => error,
                    Establish::Reattach => RuntimeError::ReattachmentFailure {
                        container: container.id().to_string(),
                        reason: error.to_string(),
                    },
                };
                inner.degrade(error.clone(), notices);
                return Err(error);
            }

            inner.transition(RuntimeState::LayersMounted, None, notices)?;
            inner.constructing = false;
            if let Err(e) = inner.flush(notices) {
                warn!(error = %e, "Initial flush after mount failed");
                return Err(e);
            }
            inner.transition(RuntimeState::Ready, None, notices)?;
            inner.degraded_by_flush = false;
            notices.push(Notice::Ready);
            Ok(())
        })
    }

    async fn create_loaded(
        &self,
        container: &Container,
        camera: CameraState,
    ) -> Result<Box<dyn RenderEngine>, EngineError> {
        let mut engine = self.factory.create(container, camera).await?;
        if let Err(e) = engine.wait_until_loaded().await {
            engine.destroy();
            return Err(e);
        }
        Ok(engine)
    }

    /// Record a failed engine construction. Init failures are fatal
    /// (`ERROR`), reattachment failures degrade.
    fn construction_failed(
        &self,
        kind: Establish,
        container: &Container,
        error: RuntimeError,
    ) -> RuntimeError {
        self.with_inner(|inner, notices| match kind {
            Establish::Initial => {
                inner.fail(&error, notices);
                error
            }
            Establish::Reattach => {
                let error = RuntimeError::ReattachmentFailure {
                    container: container.id().to_string(),
                    reason: error.to_string(),
                };
                inner.degrade(error.clone(), notices);
                error
            }
        })
    }

    // ===== Commands =====

    /// Queue a batch for the next flush.
    ///
    /// Rejected without side effects when it violates the active mode.
    pub fn update(&self, batch: &UpdateBatch) -> Result<usize, RuntimeError> {
        self.with_inner(|inner, _| {
            match inner.state() {
                RuntimeState::Destroyed => return Err(RuntimeError::Destroyed),
                RuntimeState::Uninitialized => return Err(RuntimeError::NotInitialized),
                _ => {}
            }
            if let Err(violation) = inner.mode.check(batch) {
                inner.mode_violations += 1;
                debug!(mode = %inner.mode, %violation, "Update rejected");
                return Err(violation.into());
            }
            inner.mode.absorb_range(batch);
            Ok(inner.registry.enqueue_batch(batch))
        })
    }

    /// Apply all queued updates in one frame.
    pub fn flush(&self) -> Result<FlushReport, RuntimeError> {
        self.with_inner(|inner, notices| inner.flush(notices))
    }

    /// Switch mode. Pending queued entries are discarded.
    pub fn set_mode(&self, mode: MapMode) -> Result<(), RuntimeError> {
        if let Some(range) = mode.range() {
            if !range.is_valid() {
                return Err(ModeViolation::InvalidRange.into());
            }
        }
        self.with_inner(|inner, _| {
            if inner.state() == RuntimeState::Destroyed {
                return Err(RuntimeError::Destroyed);
            }
            if inner.mode == mode {
                return Ok(());
            }
            let cleared = inner.registry.clear_queues();
            info!(from = %inner.mode, to = %mode, cleared, "Map mode changed");
            inner.mode = mode;
            Ok(())
        })
    }

    pub fn mode(&self) -> MapMode {
        self.inner.lock().mode
    }

    /// Move the camera. Applied to the engine if attached, otherwise kept
    /// for the next attach.
    pub fn set_camera(&self, camera: CameraState) -> Result<(), RuntimeError> {
        self.with_inner(|inner, _| {
            if inner.state() == RuntimeState::Destroyed {
                return Err(RuntimeError::Destroyed);
            }
            inner.camera = camera;
            if let Some(engine) = inner.engine.as_mut() {
                engine.set_camera(camera)?;
            }
            Ok(())
        })
    }

    /// Current camera: the engine's when attached, else the captured one.
    pub fn camera(&self) -> CameraState {
        let inner = self.inner.lock();
        inner
            .engine
            .as_ref()
            .map(|e| e.camera())
            .unwrap_or(inner.camera)
    }

    pub fn set_layer_visibility(&self, layer_id: &str, visible: bool) -> Result<(), RuntimeError> {
        self.with_inner(|inner, _| {
            if !inner.registry.set_visibility(layer_id, visible) {
                return Err(RuntimeError::UnknownLayer(layer_id.to_string()));
            }
            if let Some(engine) = inner.engine.as_mut() {
                engine.set_visibility(layer_id, visible)?;
            }
            Ok(())
        })
    }

    /// Forward a platform signal to the host handlers.
    pub fn notify_control_signal(&self, signal: ControlSignal) {
        self.with_inner(|_, notices| notices.push(Notice::Signal(signal)));
    }

    // ===== Queries =====

    pub fn state(&self) -> RuntimeState {
        self.inner.lock().state()
    }

    /// Last applied data of a layer.
    pub fn layer_data(&self, layer_id: &str) -> Option<FeatureCollection> {
        self.inner
            .lock()
            .registry
            .handle(layer_id)
            .map(|h| h.data.clone())
    }

    pub fn diagnostics(&self) -> RuntimeDiagnostics {
        let inner = self.inner.lock();
        RuntimeDiagnostics {
            state: inner.state(),
            history: inner.machine.history(),
            last_error: inner.last_error.clone(),
            mode: inner.mode,
            container: inner.container.as_ref().map(|c| c.id().to_string()),
            engine_attached: inner.engine.is_some(),
            camera: inner
                .engine
                .as_ref()
                .map(|e| e.camera())
                .unwrap_or(inner.camera),
            layers: inner.registry.metrics(),
            flush_count: inner.flush_count,
            flush_overruns: inner.flush_overruns,
            mode_violations: inner.mode_violations,
        }
    }

    /// Flush on a fixed interval until cancelled or destroyed.
    pub fn spawn_frame_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let interval = runtime.inner.lock().config.frame_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match runtime.flush() {
                        Ok(_) => {}
                        Err(RuntimeError::Destroyed) => break,
                        Err(e) => debug!(error = %e, "Frame flush failed"),
                    },
                }
            }
            debug!("Frame loop stopped");
        })
    }
}

impl UpdateSink for MapRuntime {
    fn submit(&self, batch: UpdateBatch) -> Result<usize, RuntimeError> {
        self.update(&batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Alert, AlertSeverity, PlaybackRange, UpdateOrigin, Vehicle, VehicleStatus};
    use crate::geo::LngLat;
    use crate::runtime::{HeadlessBehavior, HeadlessEngineFactory};
    use chrono::Utc;

    fn vehicle(id: &str, lng: f64) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            name: id.to_string(),
            position: Some(LngLat::new(lng, 53.5)),
            heading: 90.0,
            speed_kmh: 40.0,
            status: VehicleStatus::Moving,
            capacity_total: 100,
            capacity_remaining: 100,
            route_id: None,
        }
    }

    fn runtime() -> (Arc<MapRuntime>, HeadlessEngineFactory) {
        let factory = HeadlessEngineFactory::new();
        let runtime = Arc::new(MapRuntime::new(Arc::new(factory.clone())));
        (runtime, factory)
    }

    async fn ready_runtime() -> (Arc<MapRuntime>, HeadlessEngineFactory) {
        let (runtime, factory) = runtime();
        runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap();
        (runtime, factory)
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<RuntimeState>>,
        degraded: Mutex<Vec<String>>,
        ready: Mutex<usize>,
        signals: Mutex<Vec<ControlSignal>>,
    }

    impl RuntimeHandlers for Recorder {
        fn on_state_change(&self, record: &TransitionRecord) {
            self.states.lock().push(record.to);
        }
        fn on_degraded(&self, error: &RuntimeError) {
            self.degraded.lock().push(error.to_string());
        }
        fn on_ready(&self) {
            *self.ready.lock() += 1;
        }
        fn on_control_signal(&self, signal: &ControlSignal) {
            self.signals.lock().push(signal.clone());
        }
    }

    #[tokio::test]
    async fn test_init_reaches_ready() {
        let (runtime, factory) = runtime();
        let recorder = Arc::new(Recorder::default());
        runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), recorder.clone())
            .await
            .unwrap();

        assert_eq!(runtime.state(), RuntimeState::Ready);
        assert_eq!(
            *recorder.states.lock(),
            vec![
                RuntimeState::Initializing,
                RuntimeState::LoadingLayers,
                RuntimeState::LayersMounted,
                RuntimeState::Ready
            ]
        );
        assert_eq!(*recorder.ready.lock(), 1);
        assert_eq!(factory.probe().live(), 1);

        let mounted: Vec<String> = factory.probe().last_mount().into_iter().map(|(id, _)| id).collect();
        assert_eq!(mounted.first().map(String::as_str), Some("facilities"));
        assert_eq!(mounted.last().map(String::as_str), Some("alerts"));
    }

    #[tokio::test]
    async fn test_second_init_reattaches() {
        let (runtime, factory) = ready_runtime().await;
        runtime
            .init(Container::new("page-b"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap();

        assert_eq!(runtime.state(), RuntimeState::Ready);
        assert_eq!(factory.probe().created(), 2);
        assert_eq!(factory.probe().live(), 1);
        assert_eq!(runtime.diagnostics().container.as_deref(), Some("page-b"));
    }

    #[tokio::test]
    async fn test_attach_preserves_camera_exactly() {
        let (runtime, factory) = ready_runtime().await;
        let camera = CameraState::new(LngLat::new(9.993_682_1, 53.551_086_3), 12.345_678)
            .with_bearing(17.25)
            .with_pitch(42.0);
        runtime.set_camera(camera).unwrap();

        runtime.attach(Container::new("page-b")).await.unwrap();

        assert_eq!(runtime.camera(), camera);
        assert_eq!(factory.probe().peak(), 1);
        assert_eq!(factory.probe().live(), 1);
    }

    #[tokio::test]
    async fn test_detach_keeps_data_and_reattach_remounts() {
        let (runtime, factory) = ready_runtime().await;
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();
        runtime.flush().unwrap();

        runtime.detach().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Detached);
        assert_eq!(factory.probe().live(), 0);

        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v2", 10.5)]))
            .unwrap();
        let report = runtime.flush().unwrap();
        assert!(!report.rendered);

        runtime.attach(Container::new("page-b")).await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);

        let mount = factory.probe().last_mount();
        let vehicles = mount.iter().find(|(id, _)| id == "vehicles").unwrap();
        assert_eq!(vehicles.1, 2);
    }

    #[tokio::test]
    async fn test_updates_during_detach_reach_new_engine() {
        let (runtime, _factory) = ready_runtime().await;
        runtime.detach().unwrap();
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();

        runtime.attach(Container::new("page-b")).await.unwrap();
        assert_eq!(runtime.layer_data("vehicles").unwrap().len(), 1);
        assert_eq!(runtime.diagnostics().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_attach_supersedes_in_flight() {
        let (runtime, factory) = ready_runtime().await;
        factory.set_behavior(HeadlessBehavior {
            create_delay: Duration::from_secs(1),
            ..Default::default()
        });

        let first = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.attach(Container::new("page-b")).await })
        };
        tokio::task::yield_now().await;

        runtime.attach(Container::new("page-c")).await.unwrap();
        let first = first.await.unwrap();

        assert_eq!(first, Err(RuntimeError::Superseded));
        assert_eq!(runtime.state(), RuntimeState::Ready);
        assert_eq!(runtime.diagnostics().container.as_deref(), Some("page-c"));
        assert_eq!(factory.probe().live(), 1);
        assert_eq!(factory.probe().peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_moved_during_attach_survives_install() {
        let (runtime, factory) = ready_runtime().await;
        factory.set_behavior(HeadlessBehavior {
            create_delay: Duration::from_secs(1),
            ..Default::default()
        });

        let attach = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.attach(Container::new("page-b")).await })
        };
        tokio::task::yield_now().await;

        let moved = CameraState::new(LngLat::new(1.0, 2.0), 7.0);
        runtime.set_camera(moved).unwrap();
        attach.await.unwrap().unwrap();

        assert_eq!(runtime.state(), RuntimeState::Ready);
        assert_eq!(runtime.camera(), moved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_changed_during_mount_reaches_engine() {
        let (runtime, factory) = ready_runtime().await;
        factory.set_behavior(HeadlessBehavior {
            mount_delay: Duration::from_secs(1),
            ..Default::default()
        });

        let attach = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.attach(Container::new("page-b")).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        runtime.set_layer_visibility("vehicle-density", true).unwrap();
        runtime.set_layer_visibility("alerts", false).unwrap();
        attach.await.unwrap().unwrap();

        let probe = factory.probe();
        assert_eq!(probe.visible("vehicle-density"), Some(true));
        assert_eq!(probe.visible("alerts"), Some(false));
        assert_eq!(probe.visible("vehicles"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_enters_error_then_retries() {
        let (runtime, factory) = runtime();
        factory.set_behavior(HeadlessBehavior {
            create_delay: Duration::from_secs(20),
            ..Default::default()
        });

        let err = runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InitializationTimeout { phase: Phase::Init, .. }));
        assert_eq!(runtime.state(), RuntimeState::Error);
        assert_eq!(factory.probe().live(), 0);
        assert!(runtime.diagnostics().last_error.is_some());

        factory.set_behavior(HeadlessBehavior::default());
        runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_timeout_degrades_and_keeps_engine() {
        let (runtime, factory) = runtime();
        factory.set_behavior(HeadlessBehavior {
            mount_delay: Duration::from_secs(30),
            ..Default::default()
        });

        let err = runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InitializationTimeout { phase: Phase::LayerMount, .. }
        ));
        assert_eq!(runtime.state(), RuntimeState::Degraded);
        assert_eq!(factory.probe().live(), 1);
        assert!(runtime.diagnostics().engine_attached);
    }

    #[tokio::test]
    async fn test_reattach_failure_degrades() {
        let (runtime, factory) = ready_runtime().await;
        let recorder = Arc::new(Recorder::default());
        runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), recorder.clone())
            .await
            .unwrap();

        factory.set_behavior(HeadlessBehavior {
            fail_load: true,
            ..Default::default()
        });
        let err = runtime.attach(Container::new("page-b")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ReattachmentFailure { .. }));
        assert_eq!(runtime.state(), RuntimeState::Degraded);
        assert_eq!(factory.probe().live(), 0);
        assert_eq!(recorder.degraded.lock().len(), 1);

        // Still accepts updates while degraded
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();
        runtime.flush().unwrap();

        factory.set_behavior(HeadlessBehavior::default());
        runtime.attach(Container::new("page-c")).await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);
        assert_eq!(runtime.layer_data("vehicles").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_playback_without_range_rejects_and_leaves_layers() {
        let (runtime, _factory) = ready_runtime().await;
        runtime
            .set_mode(MapMode::HistoricalPlayback { range: None })
            .unwrap();

        let err = runtime
            .update(&UpdateBatch::new(UpdateOrigin::Playback).with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ModeContractViolation(ModeViolation::MissingTimeRange { .. })
        ));
        runtime.flush().unwrap();
        assert!(runtime.layer_data("vehicles").unwrap().is_empty());
        assert_eq!(runtime.diagnostics().mode_violations, 1);

        let now = Utc::now();
        let range = PlaybackRange::new(now - chrono::Duration::hours(2), now);
        runtime
            .update(
                &UpdateBatch::new(UpdateOrigin::Playback)
                    .with_vehicles(vec![vehicle("v1", 10.0)])
                    .with_playback(range),
            )
            .unwrap();
        assert_eq!(runtime.mode().range(), Some(range));
    }

    #[tokio::test]
    async fn test_mode_switch_discards_queue() {
        let (runtime, _factory) = ready_runtime().await;
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();
        runtime.set_mode(MapMode::ReadOnlyPlanning).unwrap();

        assert_eq!(runtime.diagnostics().pending(), 0);
        let report = runtime.flush().unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_flush_over_budget_degrades_then_recovers() {
        let factory = HeadlessEngineFactory::new();
        let runtime = MapRuntime::new(Arc::new(factory.clone()));
        let config = RuntimeConfig::default().with_timeouts(PhaseTimeouts {
            flush: Duration::from_millis(5),
            ..Default::default()
        });
        runtime
            .init(Container::new("page-a"), config, Arc::new(NoopHandlers))
            .await
            .unwrap();

        factory.set_behavior(HeadlessBehavior {
            commit_delay: Duration::from_millis(30),
            ..Default::default()
        });
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();
        runtime.flush().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Degraded);
        assert_eq!(runtime.diagnostics().flush_overruns, 1);

        factory.set_behavior(HeadlessBehavior::default());
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.1)]))
            .unwrap();
        runtime.flush().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);
    }

    #[tokio::test]
    async fn test_overflow_is_counted_not_propagated() {
        let factory = HeadlessEngineFactory::new();
        let runtime = MapRuntime::new(Arc::new(factory));
        runtime
            .init(
                Container::new("page-a"),
                RuntimeConfig::default().with_max_queue_len(2),
                Arc::new(NoopHandlers),
            )
            .await
            .unwrap();

        let alerts: Vec<Alert> = (0..5)
            .map(|i| Alert {
                id: format!("a{}", i),
                severity: AlertSeverity::Info,
                message: String::new(),
                position: Some(LngLat::new(10.0, 53.0)),
                vehicle_id: None,
                raised_at: Utc::now(),
            })
            .collect();
        assert_eq!(runtime.update(&UpdateBatch::live().with_alerts(alerts)).unwrap(), 5);

        let diagnostics = runtime.diagnostics();
        assert_eq!(diagnostics.layer("alerts").unwrap().dropped, 3);
        assert_eq!(diagnostics.total_dropped(), 3);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (runtime, factory) = ready_runtime().await;
        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();

        runtime.destroy();
        runtime.destroy();

        assert_eq!(runtime.state(), RuntimeState::Destroyed);
        assert_eq!(factory.probe().live(), 0);
        assert_eq!(runtime.diagnostics().pending(), 0);
        assert_eq!(
            runtime.update(&UpdateBatch::live()).unwrap_err(),
            RuntimeError::Destroyed
        );
        let err = runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), Arc::new(NoopHandlers))
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::Destroyed);
    }

    #[tokio::test]
    async fn test_update_before_init_rejected() {
        let (runtime, _factory) = runtime();
        assert_eq!(
            runtime.update(&UpdateBatch::live()).unwrap_err(),
            RuntimeError::NotInitialized
        );
        assert_eq!(
            runtime.attach(Container::new("x")).await.unwrap_err(),
            RuntimeError::NotInitialized
        );
    }

    #[tokio::test]
    async fn test_layer_visibility() {
        let (runtime, _factory) = ready_runtime().await;
        runtime.set_layer_visibility("vehicle-density", true).unwrap();
        assert!(matches!(
            runtime.set_layer_visibility("nope", true),
            Err(RuntimeError::UnknownLayer(_))
        ));
    }

    #[tokio::test]
    async fn test_control_signal_reaches_handlers() {
        let (runtime, _factory) = runtime();
        let recorder = Arc::new(Recorder::default());
        runtime
            .init(Container::new("page-a"), RuntimeConfig::default(), recorder.clone())
            .await
            .unwrap();
        runtime.notify_control_signal(ControlSignal::ActivateNow);
        assert_eq!(*recorder.signals.lock(), vec![ControlSignal::ActivateNow]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_loop_flushes() {
        let (runtime, _factory) = ready_runtime().await;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn_frame_loop(cancel.clone());

        runtime
            .update(&UpdateBatch::live().with_vehicles(vec![vehicle("v1", 10.0)]))
            .unwrap();
        tokio::time::sleep(DEFAULT_FRAME_INTERVAL * 3).await;

        assert_eq!(runtime.layer_data("vehicles").unwrap().len(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }
}
