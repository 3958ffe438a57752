//! Map modes and the mode contract.
//!
//! A mode declares what an update must carry to be accepted. Every batch is
//! checked against the active mode before anything is queued; a rejected
//! batch leaves layer state untouched.
//!
//! | Mode                 | read-only | playback data | time range |
//! |----------------------|-----------|---------------|------------|
//! | `LiveEditable`       | no        | no            | no         |
//! | `ReadOnlyPlanning`   | yes       | no            | no         |
//! | `HistoricalPlayback` | yes       | yes           | yes        |

use std::fmt;

use thiserror::Error;

use crate::entities::{PlaybackRange, UpdateBatch, UpdateOrigin};

/// Capabilities a mode requires from updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeCapabilities {
    pub requires_time_range: bool,
    pub requires_playback_data: bool,
    pub read_only: bool,
}

/// Mutually exclusive map contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    #[default]
    LiveEditable,
    ReadOnlyPlanning,
    HistoricalPlayback {
        /// Active range; may also arrive with the first playback batch.
        range: Option<PlaybackRange>,
    },
}

/// Why a batch was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeViolation {
    #[error("{mode} is read-only, edits are not accepted")]
    ReadOnly { mode: &'static str },

    #[error("{mode} requires playback data, got {origin:?} data")]
    RequiresPlaybackData {
        mode: &'static str,
        origin: UpdateOrigin,
    },

    #[error("{mode} requires a time range before entity data")]
    MissingTimeRange { mode: &'static str },

    #[error("{mode} does not accept a playback range")]
    UnexpectedPlaybackRange { mode: &'static str },

    #[error("invalid playback range")]
    InvalidRange,
}

impl MapMode {
    pub fn capabilities(&self) -> ModeCapabilities {
        match self {
            MapMode::LiveEditable => ModeCapabilities::default(),
            MapMode::ReadOnlyPlanning => ModeCapabilities {
                read_only: true,
                ..Default::default()
            },
            MapMode::HistoricalPlayback { .. } => ModeCapabilities {
                requires_time_range: true,
                requires_playback_data: true,
                read_only: true,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MapMode::LiveEditable => "live-editable",
            MapMode::ReadOnlyPlanning => "read-only-planning",
            MapMode::HistoricalPlayback { .. } => "historical-playback",
        }
    }

    /// The active playback range, if any.
    pub fn range(&self) -> Option<PlaybackRange> {
        match self {
            MapMode::HistoricalPlayback { range } => *range,
            _ => None,
        }
    }

    /// Check a batch against this mode.
    pub fn check(&self, batch: &UpdateBatch) -> Result<(), ModeViolation> {
        let caps = self.capabilities();
        let mode = self.name();

        if let Some(range) = batch.playback {
            if !caps.requires_time_range {
                return Err(ModeViolation::UnexpectedPlaybackRange { mode });
            }
            if !range.is_valid() {
                return Err(ModeViolation::InvalidRange);
            }
        }

        if !batch.has_entity_data() {
            return Ok(());
        }

        if caps.read_only && batch.origin == UpdateOrigin::Edit {
            return Err(ModeViolation::ReadOnly { mode });
        }
        if caps.requires_playback_data && batch.origin == UpdateOrigin::Live {
            return Err(ModeViolation::RequiresPlaybackData {
                mode,
                origin: batch.origin,
            });
        }
        if caps.requires_time_range && self.range().is_none() && batch.playback.is_none() {
            return Err(ModeViolation::MissingTimeRange { mode });
        }

        Ok(())
    }

    /// Fold a batch's playback range into the mode. Call after [`check`](Self::check).
    pub fn absorb_range(&mut self, batch: &UpdateBatch) {
        if let (MapMode::HistoricalPlayback { range }, Some(new)) = (self, batch.playback) {
            *range = Some(new);
        }
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
