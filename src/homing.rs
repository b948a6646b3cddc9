//! Homing transition tracker.
//!
//! The state stream is level-triggered; this turns root-status changes into
//! edge events for the two homing sub-states and learns how long each
//! direction takes.  Learned durations only ever grow, so the progress
//! estimate is a worst-case bound: the bar may finish early but never stalls.

use log::{debug, info};
use serde_json::json;
use tokio::time::{Duration, Instant};

use crate::protocol::DEFAULT_HOMING_ESTIMATE_SECS;
use crate::settings::{SettingsStore, HOMING_BACKWARD_SECS, HOMING_FORWARD_SECS};
use crate::types::{HomingDirection, HomingProgress, RootStatus};

impl HomingDirection {
    fn status(self) -> RootStatus {
        match self {
            HomingDirection::Forward => RootStatus::HomingForward,
            HomingDirection::Backward => RootStatus::HomingBackward,
        }
    }

    fn settings_key(self) -> &'static str {
        match self {
            HomingDirection::Forward => HOMING_FORWARD_SECS,
            HomingDirection::Backward => HOMING_BACKWARD_SECS,
        }
    }
}

const DIRECTIONS: [HomingDirection; 2] = [HomingDirection::Forward, HomingDirection::Backward];

/// Start timestamps and the live end estimate.  Learned durations live in the
/// settings store.
#[derive(Debug, Default)]
pub struct HomingTracker {
    forward_start: Option<Instant>,
    backward_start: Option<Instant>,
    estimated_end: Option<Instant>,
}

impl HomingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learned duration for `direction`, or the default estimate if nothing
    /// positive has been stored yet.
    pub fn expected_duration(direction: HomingDirection, store: &dyn SettingsStore) -> f64 {
        match store.get_f64(direction.settings_key()) {
            Some(secs) if secs > 0.0 => secs,
            _ => DEFAULT_HOMING_ESTIMATE_SECS,
        }
    }

    /// Feed a root-status transition.  Returns `true` when the published
    /// progress changed.
    ///
    /// Only transitions into or out of the two homing statuses do anything.
    pub fn on_status_change(
        &mut self,
        old: RootStatus,
        new: RootStatus,
        now: Instant,
        store: &mut dyn SettingsStore,
    ) -> bool {
        if old == new {
            return false;
        }
        let mut changed = false;

        for direction in DIRECTIONS {
            let status = direction.status();
            if old == status && new != status {
                if let Some(start) = self.start_mut(direction).take() {
                    let elapsed = now.saturating_duration_since(start).as_secs_f64();
                    let key = direction.settings_key();
                    let stored = store.get_f64(key).unwrap_or(0.0);
                    let learned = stored.max(elapsed);
                    store.set(key, json!(learned));
                    info!(
                        "homing {direction:?} finished in {elapsed:.2} s (learned {learned:.2} s)"
                    );
                }
                self.estimated_end = None;
                changed = true;
            }
        }

        for direction in DIRECTIONS {
            let status = direction.status();
            if new == status && old != status {
                let expected = Self::expected_duration(direction, store);
                *self.start_mut(direction) = Some(now);
                self.estimated_end = Some(now + Duration::from_secs_f64(expected));
                debug!("homing {direction:?} started, expecting {expected:.2} s");
                changed = true;
            }
        }

        changed
    }

    /// Live progress, if homing is in progress.
    pub fn progress(&self) -> Option<HomingProgress> {
        let estimated_end = self.estimated_end?;
        let (direction, started_at) = match (self.forward_start, self.backward_start) {
            (Some(start), _) => (HomingDirection::Forward, start),
            (None, Some(start)) => (HomingDirection::Backward, start),
            (None, None) => return None,
        };
        Some(HomingProgress {
            direction,
            started_at,
            estimated_end,
        })
    }

    /// Forget in-flight timestamps.  Learned durations are untouched.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn start_mut(&mut self, direction: HomingDirection) -> &mut Option<Instant> {
        match direction {
            HomingDirection::Forward => &mut self.forward_start,
            HomingDirection::Backward => &mut self.backward_start,
        }
    }
}
