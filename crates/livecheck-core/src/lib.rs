//! livecheck-core: per-frame face liveness tracking.
//!
//! Camera frames go through a throttled face detection model (ONNX Runtime),
//! the decoded face is mirrored into preview space and published to shared
//! state, and a challenge driver turns that state into user instructions.

pub mod analyzer;
pub mod challenge;
pub mod check;
pub mod detector;
pub mod frame;
pub mod geometry;
pub mod runner;
pub mod state;

pub use analyzer::{AnalyzeError, FrameAnalyzer, FrameOutcome};
pub use challenge::{ChallengeConfig, ChallengeDriver};
pub use check::{Instruction, LivenessCheckState};
pub use detector::{DetectorConfig, FaceCandidate, FaceDetector};
pub use frame::{CameraFrame, RawFrame};
pub use geometry::{FaceOvalPosition, Point, Rect};
pub use runner::{FaceModelRunner, InferenceBackend};
pub use state::{LivenessSink, LivenessState, MirroredFaceGeometry};
