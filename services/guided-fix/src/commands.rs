//! Terminal commands standing in for the on-screen buttons.

use guided_fix_core::Prompt;
use guided_fix_core::session::{SessionController, SessionError};
use guided_fix_core::speech::VoiceSettings;

pub const HELP: &str = "\
Commands:
  next               move on once the camera confirmed the step
  done               I did this step (asks for confirmation)
  yes | no           answer the open question
  switch             work on the item the camera sees instead
  insist             keep the current item, it is correct
  retry              try verifying the item again
  force              continue with the current item anyway
  mute | unmute      narration on or off
  voice <rate> <pitch>
  settings | close   open or close the settings panel
  ask <question>     ask about the current step
  plan | status      show the repair plan or the session state
  stop               end the session";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Next,
    Done,
    Yes,
    No,
    Switch,
    Insist,
    Retry,
    Force,
    Mute,
    Unmute,
    Voice(VoiceSettings),
    Settings,
    Close,
    Ask(String),
    Plan,
    Status,
    Help,
    Stop,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("nothing is waiting for a yes or no")]
    NoQuestion,
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl std::str::FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match word.to_lowercase().as_str() {
            "next" => Command::Next,
            "done" => Command::Done,
            "yes" | "y" => Command::Yes,
            "no" | "n" => Command::No,
            "switch" => Command::Switch,
            "insist" => Command::Insist,
            "retry" => Command::Retry,
            "force" => Command::Force,
            "mute" => Command::Mute,
            "unmute" => Command::Unmute,
            "voice" => {
                let mut parts = rest.split_whitespace().map(str::parse::<f32>);
                match (parts.next(), parts.next()) {
                    (Some(Ok(rate)), Some(Ok(pitch))) => {
                        Command::Voice(VoiceSettings { rate, pitch })
                    }
                    _ => return Err(CommandError::Usage("voice <rate> <pitch>")),
                }
            }
            "settings" => Command::Settings,
            "close" => Command::Close,
            "ask" if rest.is_empty() => return Err(CommandError::Usage("ask <question>")),
            "ask" => Command::Ask(rest.to_string()),
            "plan" => Command::Plan,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "stop" | "exit" | "quit" => Command::Stop,
            _ => return Err(CommandError::Unknown(word.to_string())),
        };
        Ok(command)
    }
}

/// What the terminal should do after a command ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Silent,
    Print(String),
    Quit(String),
}

pub async fn execute(
    controller: &SessionController,
    command: Command,
) -> Result<Reply, CommandError> {
    match command {
        Command::Next => controller.advance_step().await?,
        Command::Done => controller.request_advance_without_confirmation().await?,
        Command::Yes => return answer(controller, true).await,
        Command::No => return answer(controller, false).await,
        Command::Switch => controller.switch_to_detected_item().await?,
        Command::Insist => controller.insist_current_item_correct().await?,
        Command::Retry => controller.retry_verification().await?,
        Command::Force => controller.force_confirm_identity().await?,
        Command::Mute => controller.set_voice_enabled(false).await,
        Command::Unmute => controller.set_voice_enabled(true).await,
        Command::Voice(voice) => {
            controller.set_voice_settings(voice).await;
            let voice = controller.snapshot().await.voice;
            return Ok(Reply::Print(format!(
                "Voice set to rate {:.2}, pitch {:.2}",
                voice.rate, voice.pitch
            )));
        }
        Command::Settings => controller.open_settings().await,
        Command::Close => controller.close_settings().await,
        Command::Ask(question) => {
            let answer = controller.ask_question(&question).await?;
            return Ok(Reply::Print(answer));
        }
        Command::Plan => {
            let snapshot = controller.snapshot().await;
            let plan = serde_json::to_string_pretty(&snapshot.steps)
                .unwrap_or_else(|e| format!("could not render plan: {e}"));
            return Ok(Reply::Print(plan));
        }
        Command::Status => return Ok(Reply::Print(status(controller).await)),
        Command::Help => return Ok(Reply::Print(HELP.to_string())),
        Command::Stop => {
            controller.stop().await;
            return Ok(Reply::Quit("Session stopped.".to_string()));
        }
    }
    Ok(Reply::Silent)
}

// yes/no means something different for each prompt.
async fn answer(controller: &SessionController, yes: bool) -> Result<Reply, CommandError> {
    let Some(prompt) = controller.snapshot().await.prompt else {
        return Err(CommandError::NoQuestion);
    };
    match (prompt, yes) {
        (Prompt::StepOverride { .. }, true) => controller.confirm_override().await?,
        (Prompt::StepOverride { .. }, false) => controller.cancel_override().await?,
        (Prompt::IdentityConflict { .. }, true) => controller.switch_to_detected_item().await?,
        (Prompt::IdentityConflict { .. }, false) => {
            controller.insist_current_item_correct().await?
        }
        (Prompt::VerificationExhausted { .. }, true) => controller.force_confirm_identity().await?,
        (Prompt::VerificationExhausted { .. }, false) => {
            controller.stop().await;
            return Ok(Reply::Quit("Session stopped.".to_string()));
        }
        (Prompt::VerifyItem { .. }, _) => return Err(CommandError::NoQuestion),
        (Prompt::RepairFinished, true) => {
            return Ok(Reply::Quit("Great, marked as fixed.".to_string()));
        }
        (Prompt::RepairFinished, false) => {
            return Ok(Reply::Quit(
                "Sorry it's still not working. Try a new diagnosis or call a professional."
                    .to_string(),
            ));
        }
    }
    Ok(Reply::Silent)
}

async fn status(controller: &SessionController) -> String {
    let s = controller.snapshot().await;
    let step = s
        .steps
        .get(s.current_step)
        .map(|step| step.instruction.as_str())
        .unwrap_or("-");
    format!(
        "active: {}\nitem: {} ({:?})\nstep {}/{}: {} ({:?})\nvoice: {}",
        s.active,
        s.expected_item.as_deref().unwrap_or("unconfirmed"),
        s.identity,
        s.current_step + 1,
        s.steps.len(),
        step,
        s.step_state,
        if s.voice_enabled { "on" } else { "muted" },
    )
}
