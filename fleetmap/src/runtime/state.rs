//! Runtime lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!  Uninitialized ──► Initializing ──► LoadingLayers ──► LayersMounted ──► Ready
//!                        │   ▲             │  ▲              │             │
//!                        │   │             │  │              │             │
//!                        ▼   │             ▼  │              ▼             ▼
//!                      Error ┘          Degraded ◄───────────┴─────────────┘
//!
//!  Detached:  reachable from every non-terminal state, returns to LoadingLayers
//!  Destroyed: reachable from every state, terminal
//! ```
//!
//! Every transition is checked against [`RuntimeState::can_transition_to`].
//! A rejected request leaves the machine untouched and returns
//! [`TransitionError::Invalid`].

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default number of transitions kept for diagnostics.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Default budget for engine creation and style load.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default budget for mounting all layers.
pub const DEFAULT_LAYER_MOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget for one flush.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle states of the map runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    LoadingLayers,
    LayersMounted,
    Ready,
    /// Usable but impaired (mount failure, failed reattachment, slow flush).
    Degraded,
    /// No container. Layer data and queues are retained.
    Detached,
    Error,
    /// Terminal.
    Destroyed,
}

impl RuntimeState {
    pub const ALL: [RuntimeState; 9] = [
        RuntimeState::Uninitialized,
        RuntimeState::Initializing,
        RuntimeState::LoadingLayers,
        RuntimeState::LayersMounted,
        RuntimeState::Ready,
        RuntimeState::Degraded,
        RuntimeState::Detached,
        RuntimeState::Error,
        RuntimeState::Destroyed,
    ];

    /// The allowed-edge table.
    pub fn can_transition_to(self, to: RuntimeState) -> bool {
        use RuntimeState::*;

        if self == Destroyed {
            return false;
        }
        if to == Destroyed {
            return true;
        }
        if to == Detached {
            return self != Detached;
        }

        matches!(
            (self, to),
            (Uninitialized, Initializing)
                | (Initializing, LoadingLayers)
                | (Initializing, Error)
                | (Initializing, Degraded)
                | (LoadingLayers, LayersMounted)
                | (LoadingLayers, Error)
                | (LoadingLayers, Degraded)
                | (LayersMounted, Ready)
                | (LayersMounted, Degraded)
                | (LayersMounted, Error)
                | (Ready, Degraded)
                | (Ready, Error)
                | (Degraded, LoadingLayers)
                | (Degraded, Initializing)
                | (Degraded, Ready)
                | (Degraded, Error)
                | (Detached, LoadingLayers)
                | (Detached, Degraded)
                | (Detached, Error)
                | (Error, Initializing)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == RuntimeState::Destroyed
    }

    /// True once a first initialization has been started.
    pub fn is_initialized(self) -> bool {
        !matches!(self, RuntimeState::Uninitialized | RuntimeState::Destroyed)
    }

    /// States in which an engine is expected to be attached and rendering.
    pub fn is_operational(self) -> bool {
        matches!(self, RuntimeState::Ready | RuntimeState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Uninitialized => "UNINITIALIZED",
            RuntimeState::Initializing => "INITIALIZING",
            RuntimeState::LoadingLayers => "LOADING_LAYERS",
            RuntimeState::LayersMounted => "LAYERS_MOUNTED",
            RuntimeState::Ready => "READY",
            RuntimeState::Degraded => "DEGRADED",
            RuntimeState::Detached => "DETACHED",
            RuntimeState::Error => "ERROR",
            RuntimeState::Destroyed => "DESTROYED",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected transition request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid state transition {from} -> {to}")]
    Invalid { from: RuntimeState, to: RuntimeState },
}

/// One executed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RuntimeState,
    pub to: RuntimeState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Timed phases of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LayerMount,
    Flush,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => f.write_str("init"),
            Phase::LayerMount => f.write_str("layer-mount"),
            Phase::Flush => f.write_str("flush"),
        }
    }
}

/// Per-phase time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub init: Duration,
    pub layer_mount: Duration,
    pub flush: Duration,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Init => self.init,
            Phase::LayerMount => self.layer_mount,
            Phase::Flush => self.flush,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            init: DEFAULT_INIT_TIMEOUT,
            layer_mount: DEFAULT_LAYER_MOUNT_TIMEOUT,
            flush: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

/// Validated state holder with a bounded transition history.
#[derive(Debug)]
pub struct StateMachine {
    state: RuntimeState,
    history: VecDeque<TransitionRecord>,
    capacity: usize,
}

impl StateMachine {
    pub fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity.max(1);
        Self {
            state: RuntimeState::Uninitialized,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Move to `to` if the edge exists.
    pub fn transition(
        &mut self,
        to: RuntimeState,
        reason: Option<&str>,
    ) -> Result<TransitionRecord, TransitionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            debug!(%from, %to, "Rejected state transition");
            return Err(TransitionError::Invalid { from, to });
        }

        self.state = to;
        let record = TransitionRecord {
            from,
            to,
            at: Utc::now(),
            reason: reason.map(str::to_string),
        };

        match to {
            RuntimeState::Error => {
                error!(%from, %to, reason = reason.unwrap_or(""), "Runtime entered error state")
            }
            RuntimeState::Degraded => {
                warn!(%from, %to, reason = reason.unwrap_or(""), "Runtime degraded")
            }
            RuntimeState::Ready | RuntimeState::Destroyed => info!(%from, %to, "Runtime state"),
            _ => debug!(%from, %to, "Runtime state"),
        }

        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        Ok(record)
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.back()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
