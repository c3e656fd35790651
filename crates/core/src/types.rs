use serde::{Deserialize, Serialize};

/// One step of a repair plan, created once at session start and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStep {
    pub instruction: String,
    /// What the camera should show once the step is done.
    #[serde(default)]
    pub looking_for: String,
}

impl RepairStep {
    pub fn new(instruction: impl Into<String>, looking_for: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            looking_for: looking_for.into(),
        }
    }
}

/// A labelled region of the frame. Coordinates use a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Highlight {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
}

impl Highlight {
    /// Clamps the box into the visible 0-100 area.
    pub fn clamped(mut self) -> Self {
        let clamp = |v: f32| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        self.x = clamp(self.x);
        self.y = clamp(self.y);
        self.width = clamp(self.width).min(100.0 - self.x);
        self.height = clamp(self.height).min(100.0 - self.y);
        self
    }
}

/// The AI's reading of a single camera frame.
///
/// Missing fields default, so a partial response still parses into a verdict
/// that changes nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuidanceVerdict {
    pub instruction: String,
    pub step_complete: bool,
    pub wrong_item: bool,
    pub detected_item_mismatch: Option<String>,
    pub detected_object: Option<String>,
    pub should_stop: bool,
    pub safety_warning: Option<String>,
    pub highlights: Vec<Highlight>,
}

impl GuidanceVerdict {
    /// The hazard text when this verdict demands a hard stop.
    pub fn safety_stop(&self) -> Option<&str> {
        if !self.should_stop {
            return None;
        }
        self.safety_warning
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
    }

    pub fn detected_object(&self) -> Option<&str> {
        non_empty(self.detected_object.as_deref())
    }

    /// Best label for what the camera is looking at when it is the wrong item.
    pub fn mismatch_label(&self) -> Option<&str> {
        non_empty(self.detected_item_mismatch.as_deref()).or_else(|| self.detected_object())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Whether the live feed shows the object being repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdentityState {
    #[default]
    Unknown,
    Verifying,
    Confirmed,
    Mismatch,
}

impl IdentityState {
    /// Frame capture only runs in these states.
    pub fn allows_capture(self) -> bool {
        matches!(self, IdentityState::Verifying | IdentityState::Confirmed)
    }
}

/// Progress of the current repair step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    InProgress,
    PendingConfirmation,
    Confirmed,
    Overridden,
}

impl StepState {
    pub fn permits_advance(self) -> bool {
        matches!(self, StepState::Confirmed | StepState::Overridden)
    }
}
