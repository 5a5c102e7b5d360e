//! Reference challenge driver.
//!
//! Reads what the analyzer publishes and walks a [`LivenessCheckState`]
//! from the start view to `Success` once the face has stayed inside the
//! target oval for the hold duration, or to `Error` on timeout or an
//! unrecoverable failure. The clock is passed in so the driver is
//! deterministic under test.

use crate::check::LivenessCheckState;
use crate::geometry::{default_oval, face_oval_position, FaceOvalPosition, OvalTolerance, Rect};
use crate::state::{FaceSnapshot, LivenessState};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeConfig {
    /// Target oval bounding box in mirrored preview space.
    pub oval: Rect,
    pub tolerance: OvalTolerance,
    /// How long the face must stay matched before the attempt succeeds.
    pub hold_duration: Duration,
    /// Attempt fails if not successful within this long of starting.
    pub timeout: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            oval: default_oval(480.0, 640.0),
            tolerance: OvalTolerance::default(),
            hold_duration: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct ChallengeDriver {
    config: ChallengeConfig,
    state: LivenessCheckState,
    started_at: Instant,
    matched_since: Option<Instant>,
}

impl ChallengeDriver {
    pub fn new(config: ChallengeConfig, now: Instant) -> Self {
        Self {
            config,
            state: LivenessCheckState::initial_start_view(),
            started_at: now,
            matched_since: None,
        }
    }

    pub fn state(&self) -> &LivenessCheckState {
        &self.state
    }

    /// Time since the attempt started, measured on the caller's clock.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Advance from the latest snapshot and close the frame gate once the
    /// attempt is over.
    pub fn drive(&mut self, liveness: &LivenessState, now: Instant) -> &LivenessCheckState {
        let snapshot = liveness.snapshot();
        self.update(&snapshot, now);
        if self.state.is_terminal() && liveness.frame_gate() {
            liveness.set_frame_gate(false);
        }
        &self.state
    }

    /// Advance the state machine. Terminal states are sticky.
    pub fn update(&mut self, snapshot: &FaceSnapshot, now: Instant) -> &LivenessCheckState {
        if self.state.is_terminal() {
            return &self.state;
        }

        if self.elapsed(now) >= self.config.timeout {
            tracing::warn!(
                timeout_secs = self.config.timeout.as_secs_f32(),
                "challenge timed out"
            );
            self.transition(LivenessCheckState::Error, now);
            return &self.state;
        }

        let running = matches!(self.state, LivenessCheckState::Running { .. });
        let next = match (snapshot.face_count, snapshot.geometry) {
            (None, _) => None,
            (Some(0), _) => {
                self.matched_since = None;
                Some(if running {
                    LivenessCheckState::running_move_face_closer()
                } else {
                    LivenessCheckState::initial_move_face()
                })
            }
            (Some(1), Some(geometry)) => {
                let position =
                    face_oval_position(&geometry.face, &self.config.oval, &self.config.tolerance);
                Some(self.single_face(position, geometry.face, running, now))
            }
            (Some(1), None) => None,
            (Some(_), _) => {
                self.matched_since = None;
                Some(if running {
                    LivenessCheckState::running_multiple_faces()
                } else {
                    LivenessCheckState::initial_multiple_faces()
                })
            }
        };

        if let Some(next) = next {
            self.transition(next, now);
        }
        &self.state
    }

    /// End the attempt because of a failure outside the challenge itself
    /// (model or camera gone).
    pub fn fail(&mut self, reason: &str, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        tracing::error!(reason, "challenge failed");
        self.transition(LivenessCheckState::Error, now);
    }

    fn single_face(
        &mut self,
        position: FaceOvalPosition,
        face: Rect,
        running: bool,
        now: Instant,
    ) -> LivenessCheckState {
        if !running && position == FaceOvalPosition::TooClose {
            return LivenessCheckState::initial_move_face_further();
        }
        if position != FaceOvalPosition::Matched {
            self.matched_since = None;
            return LivenessCheckState::running_with_oval_position(position);
        }

        let since = *self.matched_since.get_or_insert(now);
        if now.duration_since(since) >= self.config.hold_duration {
            LivenessCheckState::success(face)
        } else {
            LivenessCheckState::running_with_oval_position(position)
        }
    }

    fn transition(&mut self, next: LivenessCheckState, now: Instant) {
        if next == self.state {
            return;
        }
        if next.is_terminal() {
            tracing::info!(
                state = ?next,
                elapsed_ms = self.elapsed(now).as_millis() as u64,
                "challenge finished"
            );
        } else {
            tracing::debug!(from = ?self.state, to = ?next, "challenge state changed");
        }
        self.state = next;
    }
}
