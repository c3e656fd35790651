use guided_fix_core::types::IdentityState;
use guided_fix_core::{EndReason, Haptic, Prompt, SessionEvent};

/// Terminal rendering of a session event. `None` for events with nothing to show.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::GuidanceUpdated(text) => format!("guide: {text}"),
        SessionEvent::HighlightsUpdated(highlights) if highlights.is_empty() => return None,
        SessionEvent::HighlightsUpdated(highlights) => {
            let labels: Vec<String> = highlights
                .iter()
                .map(|h| format!("{} @ ({:.0}, {:.0})", h.label, h.x, h.y))
                .collect();
            format!("  [{}]", labels.join(", "))
        }
        SessionEvent::IdentityChanged(IdentityState::Confirmed) => "Item confirmed".to_string(),
        SessionEvent::IdentityChanged(IdentityState::Mismatch) => {
            "That doesn't look like the right item".to_string()
        }
        SessionEvent::IdentityChanged(_) => return None,
        SessionEvent::StepChanged {
            index,
            total,
            instruction,
        } => format!("Step {} of {}: {instruction}", index + 1, total),
        SessionEvent::StepStateChanged(state) => format!("  step: {state:?}"),
        SessionEvent::PromptOpened(prompt) => render_prompt(prompt),
        SessionEvent::PromptClosed => return None,
        SessionEvent::Haptic(Haptic::Success) => return None,
        SessionEvent::Haptic(Haptic::Warning | Haptic::Error) => "\x07".to_string(),
        SessionEvent::SafetyNotice(text) => format!("warning: {text}"),
        SessionEvent::CameraUnavailable(text) => format!("camera: {text}"),
        SessionEvent::Error(text) => format!("error: {text}"),
        SessionEvent::SessionEnded(reason) => match reason {
            EndReason::Completed => "Repair complete.".to_string(),
            EndReason::SafetyStop(warning) => format!("STOP: {warning}"),
            EndReason::UserStopped => "Session ended.".to_string(),
            EndReason::PlanUnavailable => "No repair plan, session ended.".to_string(),
        },
    };
    Some(line)
}

fn render_prompt(prompt: &Prompt) -> String {
    match prompt {
        Prompt::IdentityConflict { expected, detected } => format!(
            "? The camera sees a {detected}, not the {expected}.\n  yes/switch = work on the {detected}, no/insist = it is the {expected}, force = continue anyway"
        ),
        Prompt::VerifyItem { expected } => {
            format!("? Show me the {expected} clearly so I can check it again.")
        }
        Prompt::VerificationExhausted { expected, detected } => format!(
            "? I still can't confirm the {expected} (I see a {detected}).\n  retry = try again, yes/force = continue anyway, no/stop = exit"
        ),
        Prompt::StepOverride { step } => {
            format!("? The camera hasn't confirmed step {} yet. Did you finish it? (yes/no)", step + 1)
        }
        Prompt::RepairFinished => "? Is it fixed? (yes/no)".to_string(),
    }
}
