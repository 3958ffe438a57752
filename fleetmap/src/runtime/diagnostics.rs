//! Runtime diagnostics snapshot.

use std::fmt;

use super::engine::CameraState;
use super::mode::MapMode;
use super::state::{RuntimeState, TransitionRecord};
use crate::layers::LayerMetrics;

/// Point-in-time view of the runtime for host UIs and logs.
#[derive(Debug, Clone)]
pub struct RuntimeDiagnostics {
    pub state: RuntimeState,
    pub history: Vec<TransitionRecord>,
    pub last_error: Option<String>,
    pub mode: MapMode,
    pub container: Option<String>,
    pub engine_attached: bool,
    pub camera: CameraState,
    pub layers: Vec<LayerMetrics>,
    pub flush_count: u64,
    pub flush_overruns: u64,
    pub mode_violations: u64,
}

impl RuntimeDiagnostics {
    pub fn layer(&self, layer_id: &str) -> Option<&LayerMetrics> {
        self.layers.iter().find(|m| m.layer_id == layer_id)
    }

    pub fn total_dropped(&self) -> u64 {
        self.layers.iter().map(|m| m.dropped).sum()
    }

    pub fn pending(&self) -> usize {
        self.layers.iter().map(|m| m.pending).sum()
    }

    /// True when the host should show a degraded banner.
    pub fn is_impaired(&self) -> bool {
        matches!(self.state, RuntimeState::Degraded | RuntimeState::Error)
    }
}

impl fmt::Display for RuntimeDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "state={} mode={} container={} flushes={} overruns={}",
            self.state,
            self.mode,
            self.container.as_deref().unwrap_or("-"),
            self.flush_count,
            self.flush_overruns
        )?;
        if let Some(err) = &self.last_error {
            writeln!(f, "last error: {}", err)?;
        }
        for m in &self.layers {
            writeln!(
                f,
                "  {:<16} enqueued={:<6} dropped={:<4} coalesced={:<6} flushed={:<6} pending={}",
                m.layer_id, m.enqueued, m.dropped, m.coalesced, m.flushed, m.pending
            )?;
        }
        Ok(())
    }
}
