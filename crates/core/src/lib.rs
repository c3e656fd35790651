pub mod camera;
pub mod demo_guide;
pub mod guide;
pub mod identity_gate;
pub mod openai_guide;
pub mod options;
pub mod session;
pub mod speech;
pub mod step_gate;
pub mod types;

use crate::types::{Highlight, IdentityState, StepState};

/// Signals the session controller emits for the UI layer.
///
/// The controller never renders anything itself; the runtime decides how a
/// prompt or a haptic cue is presented.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// New guidance text to show on screen.
    GuidanceUpdated(String),
    /// Overlay boxes for the latest frame.
    HighlightsUpdated(Vec<Highlight>),
    IdentityChanged(IdentityState),
    StepChanged {
        /// 0-based.
        index: usize,
        total: usize,
        instruction: String,
    },
    StepStateChanged(StepState),
    PromptOpened(Prompt),
    PromptClosed,
    Haptic(Haptic),
    /// A non-blocking hazard note that did not demand a stop.
    SafetyNotice(String),
    CameraUnavailable(String),
    Error(String),
    SessionEnded(EndReason),
}

/// A decision the user has to make.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// The camera keeps seeing something other than the expected item.
    /// Choices: switch to the detected item, insist, or force-confirm.
    IdentityConflict { expected: String, detected: String },
    /// Asks for a clearer view of the item. Frames keep flowing.
    VerifyItem { expected: String },
    /// Verification rounds are used up. Choices: retry, continue anyway, exit.
    VerificationExhausted { expected: String, detected: String },
    /// "I did this step" before the camera confirmed it.
    StepOverride { step: usize },
    /// All steps done. Choices: mark fixed, or ask for more help.
    RepairFinished,
}

impl Prompt {
    /// Blocking prompts pause frame analysis while open.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Prompt::VerifyItem { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Haptic {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    Completed,
    SafetyStop(String),
    UserStopped,
    PlanUnavailable,
}
