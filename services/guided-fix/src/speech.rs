use anyhow::{Result, anyhow};
use guided_fix_core::speech::{SpeechOptions, SpeechOutput};
use std::sync::Mutex;

/// Prints narration to the terminal in place of a text-to-speech engine.
#[derive(Default)]
pub struct ConsoleSpeech {
    current: Mutex<Option<String>>,
}

impl ConsoleSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    /// The utterance that has not been cut off yet, if any.
    pub fn current(&self) -> Option<String> {
        self.current.lock().ok().and_then(|c| c.clone())
    }
}

impl SpeechOutput for ConsoleSpeech {
    fn speak(&self, text: &str, options: &SpeechOptions) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow!("speech state poisoned"))?;
        if let Some(previous) = current.take() {
            tracing::debug!("Cutting off: \"{previous}\"");
        }
        println!("{}", console_line(text, options.urgent));
        tracing::trace!("rate={:.2} pitch={:.2}", options.rate, options.pitch);
        *current = Some(text.to_string());
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut current) = self.current.lock() {
            current.take();
        }
    }
}

fn console_line(text: &str, urgent: bool) -> String {
    if urgent {
        format!("say (urgent): {text}")
    } else {
        format!("say: {text}")
    }
}
