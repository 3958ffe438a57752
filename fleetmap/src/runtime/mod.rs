//! Map runtime: the single owner of the render engine.
//!
//! The runtime survives any number of container swaps. Hosts talk to it only
//! through commands ([`MapRuntime::update`], [`MapRuntime::set_mode`],
//! [`MapRuntime::attach`], ...) and never hold an engine reference.
//!
//! ```text
//!             init()                 attach(new)
//!   host ───────────────► MapRuntime ─────────────► destroy old engine
//!                            │                      create new (same camera)
//!                            │                      re-mount layers + data
//!                            ▼
//!                    update() ─► LayerRegistry queues ─► flush() ─► engine frame
//! ```

mod diagnostics;
mod engine;
mod headless;
mod map;
mod mode;
mod state;

pub use diagnostics::RuntimeDiagnostics;
pub use engine::{CameraState, Container, EngineError, EngineFactory, RenderEngine};
pub use headless::{EngineProbe, HeadlessBehavior, HeadlessEngine, HeadlessEngineFactory};
pub use map::{
    MapRuntime, NoopHandlers, RuntimeConfig, RuntimeError, RuntimeHandlers, UpdateSink,
    DEFAULT_FRAME_INTERVAL,
};
pub use mode::{MapMode, ModeCapabilities, ModeViolation};
pub use state::{
    Phase, PhaseTimeouts, RuntimeState, StateMachine, TransitionError, TransitionRecord,
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_HISTORY_CAPACITY, DEFAULT_INIT_TIMEOUT,
    DEFAULT_LAYER_MOUNT_TIMEOUT,
};
