//! Challenge states shown to the user, and the instructions they carry.

use crate::geometry::{FaceOvalPosition, Rect};
use serde::Serialize;
use std::fmt;

/// Identifies one user-facing instruction. The UI localises by [`Instruction::key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    MoveFace,
    MultipleFacesDetected,
    MoveFaceFurther,
    Connecting,
    CenterFace,
    MoveFaceCloser,
    HoldStill,
    MoveLeft,
    MoveRight,
    Verifying,
}

impl Instruction {
    pub fn key(&self) -> &'static str {
        match self {
            Self::MoveFace => "liveness.instruction.move_face",
            Self::MultipleFacesDetected => "liveness.instruction.multiple_faces_detected",
            Self::MoveFaceFurther => "liveness.instruction.move_face_further",
            Self::Connecting => "liveness.connecting",
            Self::CenterFace => "liveness.get_ready.center_face",
            Self::MoveFaceCloser => "liveness.instruction.move_face_closer",
            Self::HoldStill => "liveness.instruction.hold_still",
            Self::MoveLeft => "liveness.instruction.move_left",
            Self::MoveRight => "liveness.instruction.move_right",
            Self::Verifying => "liveness.verifying",
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Self::MoveFace => "Move face in front of camera",
            Self::MultipleFacesDetected => "Ensure only one face is in front of camera",
            Self::MoveFaceFurther => "Move face further away",
            Self::Connecting => "Connecting...",
            Self::CenterFace => "Center your face",
            Self::MoveFaceCloser => "Move closer",
            Self::HoldStill => "Hold still",
            Self::MoveLeft => "Move left",
            Self::MoveRight => "Move right",
            Self::Verifying => "Verifying...",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl From<FaceOvalPosition> for Instruction {
    fn from(position: FaceOvalPosition) -> Self {
        match position {
            FaceOvalPosition::Matched => Self::HoldStill,
            FaceOvalPosition::TooFar => Self::MoveFaceCloser,
            FaceOvalPosition::TooClose => Self::MoveFaceFurther,
            FaceOvalPosition::MoveLeft => Self::MoveLeft,
            FaceOvalPosition::MoveRight => Self::MoveRight,
        }
    }
}

/// Where a single liveness attempt stands.
///
/// `Error` and `Success` are terminal for the attempt; a retry starts a new
/// attempt from `Initial`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LivenessCheckState {
    Initial {
        instruction: Option<Instruction>,
        is_actionable: bool,
    },
    Running {
        instruction: Option<Instruction>,
    },
    Error,
    Success {
        face_guide_rect: Rect,
    },
}

impl Default for LivenessCheckState {
    fn default() -> Self {
        Self::Initial {
            instruction: None,
            is_actionable: true,
        }
    }
}

impl LivenessCheckState {
    fn initial(instruction: Instruction) -> Self {
        Self::Initial {
            instruction: Some(instruction),
            is_actionable: true,
        }
    }

    pub fn initial_move_face() -> Self {
        Self::initial(Instruction::MoveFace)
    }

    pub fn initial_multiple_faces() -> Self {
        Self::initial(Instruction::MultipleFacesDetected)
    }

    pub fn initial_move_face_further() -> Self {
        Self::initial(Instruction::MoveFaceFurther)
    }

    /// Shown while the session is being set up; input is not accepted yet.
    pub fn initial_connecting() -> Self {
        Self::Initial {
            instruction: Some(Instruction::Connecting),
            is_actionable: false,
        }
    }

    pub fn initial_start_view() -> Self {
        Self::initial(Instruction::CenterFace)
    }

    pub fn running_move_face_closer() -> Self {
        Self::Running {
            instruction: Some(Instruction::MoveFaceCloser),
        }
    }

    pub fn running_multiple_faces() -> Self {
        Self::Running {
            instruction: Some(Instruction::MultipleFacesDetected),
        }
    }

    pub fn running_with_oval_position(position: FaceOvalPosition) -> Self {
        Self::Running {
            instruction: Some(position.into()),
        }
    }

    pub fn success(face_guide_rect: Rect) -> Self {
        Self::Success { face_guide_rect }
    }

    pub fn instruction(&self) -> Option<Instruction> {
        match self {
            Self::Initial { instruction, .. } | Self::Running { instruction } => *instruction,
            Self::Error => None,
            Self::Success { .. } => Some(Instruction::Verifying),
        }
    }

    pub fn is_actionable(&self) -> bool {
        match self {
            Self::Initial { is_actionable, .. } => *is_actionable,
            Self::Running { .. } => true,
            Self::Error | Self::Success { .. } => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Success { .. })
    }
}
