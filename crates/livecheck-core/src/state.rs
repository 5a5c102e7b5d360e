//! Shared liveness state between the frame analyzer and the challenge driver.
//!
//! Each field has exactly one writer. The analyzer publishes the face count
//! and the mirrored geometry; the driver owns the frame gate. Published
//! values travel through `watch` cells so readers always see the latest
//! complete value and can wait for the next one.

use crate::geometry::{Point, Rect};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

/// The calls the analyzer makes against shared state.
pub trait LivenessSink {
    /// Whether the frame currently being delivered should run inference.
    fn should_analyze_frame(&self) -> bool;
    fn report_face_count(&self, count: usize);
    fn report_face_geometry(&self, geometry: MirroredFaceGeometry);
}

/// Face box and landmarks in the caller's mirrored preview space.
///
/// Always published as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MirroredFaceGeometry {
    pub face: Rect,
    pub left_eye: Point,
    pub right_eye: Point,
    pub mouth: Point,
}

/// Point-in-time view of what the analyzer has published.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceSnapshot {
    /// `None` until the first analyzed frame.
    pub face_count: Option<usize>,
    /// Last published geometry. Not cleared by zero- or multi-face frames.
    pub geometry: Option<MirroredFaceGeometry>,
}

pub struct LivenessState {
    gate_open: AtomicBool,
    every_nth_frame: u64,
    frames_offered: AtomicU64,
    face_count: watch::Sender<Option<usize>>,
    geometry: watch::Sender<Option<MirroredFaceGeometry>>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::with_cadence(1)
    }
}

impl LivenessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze one frame in every `every_nth_frame` while the gate is open.
    pub fn with_cadence(every_nth_frame: u32) -> Self {
        let (face_count, _) = watch::channel(None);
        let (geometry, _) = watch::channel(None);
        Self {
            gate_open: AtomicBool::new(true),
            every_nth_frame: u64::from(every_nth_frame.max(1)),
            frames_offered: AtomicU64::new(0),
            face_count,
            geometry,
        }
    }

    /// Written by the challenge driver only.
    pub fn set_frame_gate(&self, open: bool) {
        let was = self.gate_open.swap(open, Ordering::AcqRel);
        if was != open {
            tracing::debug!(open, "frame gate changed");
        }
    }

    pub fn frame_gate(&self) -> bool {
        self.gate_open.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> FaceSnapshot {
        FaceSnapshot {
            face_count: *self.face_count.borrow(),
            geometry: *self.geometry.borrow(),
        }
    }

    pub fn subscribe(&self) -> LivenessWatcher {
        LivenessWatcher {
            face_count: self.face_count.subscribe(),
            geometry: self.geometry.subscribe(),
        }
    }
}

impl LivenessSink for LivenessState {
    fn should_analyze_frame(&self) -> bool {
        let n = self.frames_offered.fetch_add(1, Ordering::AcqRel);
        self.frame_gate() && n % self.every_nth_frame == 0
    }

    fn report_face_count(&self, count: usize) {
        self.face_count.send_replace(Some(count));
    }

    fn report_face_geometry(&self, geometry: MirroredFaceGeometry) {
        self.geometry.send_replace(Some(geometry));
    }
}

/// Reader handle for the challenge driver or a UI.
///
/// The face count is reported on every analyzed frame, so it doubles as the
/// "new frame analyzed" signal.
pub struct LivenessWatcher {
    face_count: watch::Receiver<Option<usize>>,
    geometry: watch::Receiver<Option<MirroredFaceGeometry>>,
}

impl LivenessWatcher {
    /// Whether an analyzed frame has been published since the last read.
    pub fn has_changed(&self) -> bool {
        self.face_count.has_changed().unwrap_or(false)
    }

    /// Latest values, marking them as seen.
    pub fn snapshot(&mut self) -> FaceSnapshot {
        FaceSnapshot {
            face_count: *self.face_count.borrow_and_update(),
            geometry: *self.geometry.borrow_and_update(),
        }
    }

    /// Wait for the next analyzed frame. Errors once the state is dropped.
    pub async fn changed(&mut self) -> Result<FaceSnapshot, watch::error::RecvError> {
        self.face_count.changed().await?;
        Ok(self.snapshot())
    }
}
