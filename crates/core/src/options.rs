//! Tunables for a guided-fix session.

use crate::identity_gate::DEFAULT_MISMATCH_THRESHOLD;
use crate::speech::VoiceSettings;
use crate::step_gate::{CONFIRMATION_WINDOW, CONFIRMATIONS_REQUIRED};
use std::time::Duration;

/// Period of the frame capture timer.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(3000);
/// Minimum gap between two AI-driven guidance text/speech updates.
pub const DEFAULT_MIN_GUIDANCE_INTERVAL: Duration = Duration::from_millis(4000);
/// Upper bound on one vision call.
pub const DEFAULT_GUIDANCE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(45);
/// Pause between "I can see the item" and the first step.
pub const DEFAULT_ANNOUNCE_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub frame_interval: Duration,
    pub min_guidance_interval: Duration,
    pub guidance_timeout: Duration,
    pub plan_timeout: Duration,
    pub announce_delay: Duration,
    pub mismatch_threshold: u32,
    /// Consecutive frames with no recognisable object before asking the user
    /// to adjust the camera.
    pub no_object_prompt_after: u32,
    pub max_verification_rounds: u32,
    pub confirmation_window: usize,
    pub confirmations_required: usize,
    pub voice_enabled: bool,
    pub voice: VoiceSettings,
    pub voice_questions: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            min_guidance_interval: DEFAULT_MIN_GUIDANCE_INTERVAL,
            guidance_timeout: DEFAULT_GUIDANCE_TIMEOUT,
            plan_timeout: DEFAULT_PLAN_TIMEOUT,
            announce_delay: DEFAULT_ANNOUNCE_DELAY,
            mismatch_threshold: DEFAULT_MISMATCH_THRESHOLD,
            no_object_prompt_after: 3,
            max_verification_rounds: 2,
            confirmation_window: CONFIRMATION_WINDOW,
            confirmations_required: CONFIRMATIONS_REQUIRED,
            voice_enabled: true,
            voice: VoiceSettings::default(),
            voice_questions: false,
        }
    }
}

impl SessionOptions {
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_min_guidance_interval(mut self, interval: Duration) -> Self {
        self.min_guidance_interval = interval;
        self
    }

    pub fn with_guidance_timeout(mut self, timeout: Duration) -> Self {
        self.guidance_timeout = timeout;
        self
    }

    pub fn with_announce_delay(mut self, delay: Duration) -> Self {
        self.announce_delay = delay;
        self
    }

    pub fn with_voice_enabled(mut self, enabled: bool) -> Self {
        self.voice_enabled = enabled;
        self
    }

    pub fn with_voice_questions(mut self, enabled: bool) -> Self {
        self.voice_questions = enabled;
        self
    }
}
