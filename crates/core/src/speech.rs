use anyhow::Result;
#[cfg(test)]
use mockall::automock;

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 2.0;
pub const MIN_PITCH: f32 = 0.5;
pub const MAX_PITCH: f32 = 2.0;

/// User-tunable narration voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub rate: f32,
    pub pitch: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 0.95,
            pitch: 1.0,
        }
    }
}

impl VoiceSettings {
    pub fn clamped(self) -> Self {
        Self {
            rate: self.rate.clamp(MIN_RATE, MAX_RATE),
            pitch: self.pitch.clamp(MIN_PITCH, MAX_PITCH),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechOptions {
    pub pitch: f32,
    pub rate: f32,
    /// Urgent utterances are spoken even when narration is muted.
    pub urgent: bool,
}

impl SpeechOptions {
    pub fn normal(voice: VoiceSettings) -> Self {
        Self {
            pitch: voice.pitch,
            rate: voice.rate,
            urgent: false,
        }
    }

    /// Slightly faster and higher than the user's voice so warnings stand out.
    pub fn urgent(voice: VoiceSettings) -> Self {
        Self {
            pitch: (voice.pitch * 1.15).min(MAX_PITCH),
            rate: (voice.rate * 1.1).min(MAX_RATE),
            urgent: true,
        }
    }
}

/// A text-to-speech engine.
///
/// Implementations must cut off whatever is currently being spoken before
/// starting a new utterance. Narration is never queued.
#[cfg_attr(test, automock)]
pub trait SpeechOutput: Send + Sync {
    fn speak(&self, text: &str, options: &SpeechOptions) -> Result<()>;

    fn stop(&self);
}
