use anyhow::{Context, Result};
use clap::Parser;
use guided_fix_core::camera::FrameSource;
use guided_fix_core::demo_guide::DemoGuide;
use guided_fix_core::guide::{GuidanceClient, RepairPlanProvider};
use guided_fix_core::openai_guide::OpenAiGuide;
use guided_fix_core::session::{Collaborators, SessionController};
use guided_fix_core::{EndReason, SessionEvent};
use guided_fix_service::commands::{self, Command, Reply};
use guided_fix_service::config::{Config, GuideProvider};
use guided_fix_service::display::render_event;
use guided_fix_service::frames::{DirectoryFrameSource, SyntheticFrameSource};
use guided_fix_service::prompt_loader;
use guided_fix_service::speech::ConsoleSpeech;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Camera-guided step-by-step repair session")]
struct Cli {
    /// What is being repaired, e.g. "faucet"
    category: String,
    /// Summary of what is wrong
    #[arg(long)]
    diagnosis: String,
    /// Most likely cause, if known
    #[arg(long)]
    cause: Option<String>,
    /// Directory of still images to replay as camera frames
    #[arg(long)]
    frames: Option<PathBuf>,
    /// Run offline with the scripted demo guide
    #[arg(long)]
    demo: bool,
    /// Start with narration muted
    #[arg(long)]
    mute: bool,
    /// Allow `ask <question>` during the session
    #[arg(long)]
    voice_questions: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // --- 1. Load Configuration ---
    let provider = args.demo.then_some(GuideProvider::Demo);
    let config = Config::from_env(provider).context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Configuration loaded successfully. Starting guided-fix session...");

    // --- 3. Build Collaborators ---
    let (guide, planner) = match config.provider {
        GuideProvider::OpenAI => {
            let prompts = prompt_loader::load_prompts(&config.prompts_dir)
                .context("Failed to load LLM prompts")?;
            tracing::info!("Loaded {} prompt override(s).", prompts.len());
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY must be set for openai provider")?;
            let guide = Arc::new(OpenAiGuide::new(
                api_key,
                config.chat_model.clone(),
                prompts,
            )?);
            (
                guide.clone() as Arc<dyn GuidanceClient>,
                guide as Arc<dyn RepairPlanProvider>,
            )
        }
        GuideProvider::Demo => {
            tracing::info!("Using the offline demo guide");
            let guide = Arc::new(DemoGuide::new());
            (
                guide.clone() as Arc<dyn GuidanceClient>,
                guide as Arc<dyn RepairPlanProvider>,
            )
        }
    };

    let frames: Arc<dyn FrameSource> = match &args.frames {
        Some(dir) => Arc::new(DirectoryFrameSource::new(dir)?),
        None if config.provider == GuideProvider::Demo => Arc::new(SyntheticFrameSource::new(1)),
        None => anyhow::bail!("--frames <dir> is required without --demo"),
    };

    let options = config
        .session_options()
        .with_voice_enabled(!args.mute)
        .with_voice_questions(args.voice_questions);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<SessionEvent>();
    let controller = SessionController::new(
        Collaborators {
            guide,
            planner,
            speech: Arc::new(ConsoleSpeech::new()),
            frames,
        },
        options,
        event_tx,
    );

    // --- 4. Render Events ---
    // Ends when the session ends for any reason other than completion; a
    // completed session still waits for the "is it fixed?" answer.
    let event_printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some(line) = render_event(&event) {
                println!("{line}");
            }
            if let SessionEvent::SessionEnded(reason) = event {
                if reason != EndReason::Completed {
                    return reason;
                }
            }
        }
        EndReason::UserStopped
    });

    controller
        .start(&args.category, &args.diagnosis, args.cause.as_deref())
        .await
        .context("Failed to start the session")?;
    println!("Type 'help' for commands.");

    // --- 5. Read User Commands ---
    let input_controller = controller.clone();
    let input_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read from stdin: {:?}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = match line.parse::<Command>() {
                Ok(command) => commands::execute(&input_controller, command).await,
                Err(e) => Err(e),
            };
            match reply {
                Ok(Reply::Silent) => {}
                Ok(Reply::Print(text)) => println!("{text}"),
                Ok(Reply::Quit(text)) => {
                    println!("{text}");
                    break;
                }
                Err(e) => println!("{e}"),
            }
        }
    });

    tokio::select! {
        reason = event_printer => {
            tracing::info!("Session ended: {:?}", reason);
        },
        _ = input_handle => {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
        }
    }
    controller.stop().await;
    tracing::info!("Shutting down...");
    Ok(())
}
