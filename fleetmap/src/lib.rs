//! Fleetmap - map runtime lifecycle and telemetry pipeline
//!
//! This library owns one interactive map surface for the lifetime of an
//! application and keeps it fed with fleet telemetry:
//!
//! - [`runtime`] - the singleton [`MapRuntime`](runtime::MapRuntime) with its
//!   lifecycle state machine, container reattachment and mode contracts
//! - [`layers`] - per-layer bounded update queues with coalescing
//! - [`geo`] - coordinates and the entity-to-feature transformer
//! - [`entities`] - domain entities and the closed update batch
//! - [`telemetry`] - debouncing, smoothing and write-through of live sources
//! - [`store`] - the offline store (tiles, snapshots, actions, analytics, metadata)
//! - [`sync`] - durable mutation queue with retry and ordering keys
//! - [`platform`] - control signals from the host platform
//! - [`simulation`] - a movement engine producing telemetry like a live backend
//! - [`config`] / [`logging`] - INI configuration and tracing setup

pub mod config;
pub mod entities;
pub mod geo;
pub mod layers;
pub mod logging;
pub mod platform;
pub mod runtime;
pub mod simulation;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::{ConfigError, ConfigFile};
pub use entities::UpdateBatch;
pub use runtime::{MapRuntime, RuntimeError, RuntimeState};
pub use store::OfflineStore;
pub use sync::SyncQueueManager;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
