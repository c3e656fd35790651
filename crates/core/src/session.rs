use crate::camera::{CaptureError, Frame, FrameSource};
use crate::guide::{
    GuidanceClient, GuidanceRequest, PlanRequest, QuestionRequest, RepairPlanProvider,
};
use crate::identity_gate::IdentityGate;
use crate::options::SessionOptions;
use crate::speech::{SpeechOptions, SpeechOutput, VoiceSettings};
use crate::step_gate::StepConfirmationGate;
use crate::types::{GuidanceVerdict, Highlight, IdentityState, RepairStep, StepState};
use crate::{EndReason, Haptic, Prompt, SessionEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[cfg(test)]
mod tests;

const UNKNOWN_OBJECT: &str = "something else";
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("a session has already been started on this controller")]
    AlreadyStarted,
    #[error("the session is not active")]
    NotActive,
    #[error("could not load a repair plan: {0}")]
    PlanUnavailable(String),
    #[error("the current step is not confirmed yet ({0:?})")]
    StepNotConfirmed(StepState),
    #[error("the item has not been confirmed yet ({0:?})")]
    IdentityNotConfirmed(IdentityState),
    #[error("there is no item mismatch to resolve")]
    NoMismatch,
    #[error("no alternate item was detected")]
    NoDetectedItem,
    #[error("no step override is waiting for confirmation")]
    NoOverridePending,
    #[error("voice questions are disabled for this session")]
    VoiceQuestionsDisabled,
    #[error("could not answer the question: {0}")]
    QuestionFailed(String),
}

/// The external capabilities a session depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub guide: Arc<dyn GuidanceClient>,
    pub planner: Arc<dyn RepairPlanProvider>,
    pub speech: Arc<dyn SpeechOutput>,
    pub frames: Arc<dyn FrameSource>,
}

/// What happened to one timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Skipped(SkipReason),
    /// The camera produced nothing, or capture failed.
    NoFrame,
    /// The guidance call failed or timed out.
    NoVerdict,
    Applied,
    /// The step changed while the request was in flight.
    Stale,
    SafetyStopped,
    /// The verdict arrived after the session stopped capturing.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Inactive,
    IdentityMismatch,
    PromptOpen,
    SettingsOpen,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub active: bool,
    pub identity: IdentityState,
    pub step_state: StepState,
    pub current_step: usize,
    pub steps: Vec<RepairStep>,
    pub expected_item: Option<String>,
    pub detected_item: Option<String>,
    pub identity_checks_skipped: bool,
    pub consecutive_mismatches: u32,
    pub confirmation_samples: usize,
    pub failed_verification_rounds: u32,
    pub prompt: Option<Prompt>,
    pub settings_open: bool,
    pub voice_enabled: bool,
    pub voice: VoiceSettings,
    pub guidance_text: String,
    pub highlights: Vec<Highlight>,
    pub timer_running: bool,
}

#[derive(Debug, Clone, Default)]
struct RepairContext {
    category: String,
    diagnosis_summary: String,
    likely_cause: Option<String>,
}

impl RepairContext {
    fn problem_description(&self) -> String {
        match &self.likely_cause {
            Some(cause) => format!("{} Likely cause: {cause}", self.diagnosis_summary),
            None => self.diagnosis_summary.clone(),
        }
    }
}

enum IdentityRead {
    Match(String),
    Mismatch(String),
    Nothing,
}

struct SessionState {
    started: bool,
    ended: bool,
    active: bool,
    context: RepairContext,
    steps: Vec<RepairStep>,
    current_step: usize,
    identity: IdentityState,
    step_state: StepState,
    identity_gate: IdentityGate,
    step_gate: StepConfirmationGate,
    expected_item: Option<String>,
    detected_item: Option<String>,
    skip_identity_checks: bool,
    no_object_frames: u32,
    verification_round: bool,
    failed_verification_rounds: u32,
    prompt: Option<Prompt>,
    settings_open: bool,
    voice_enabled: bool,
    voice: VoiceSettings,
    guidance_text: String,
    highlights: Vec<Highlight>,
    last_guidance_at: Option<Instant>,
    last_safety_notice: Option<String>,
    // Bumped whenever the step or the expected item changes; verdicts for
    // requests issued under an older value are stale.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new(options: &SessionOptions) -> Self {
        Self {
            started: false,
            ended: false,
            active: false,
            context: RepairContext::default(),
            steps: Vec::new(),
            current_step: 0,
            identity: IdentityState::Unknown,
            step_state: StepState::InProgress,
            identity_gate: IdentityGate::new(options.mismatch_threshold),
            step_gate: StepConfirmationGate::new(
                options.confirmation_window,
                options.confirmations_required,
            ),
            expected_item: None,
            detected_item: None,
            skip_identity_checks: false,
            no_object_frames: 0,
            verification_round: false,
            failed_verification_rounds: 0,
            prompt: None,
            settings_open: false,
            voice_enabled: options.voice_enabled,
            voice: options.voice.clamped(),
            guidance_text: String::new(),
            highlights: Vec::new(),
            last_guidance_at: None,
            last_safety_notice: None,
            generation: 0,
            timer: None,
        }
    }

    fn capture_blocker(&self) -> Option<SkipReason> {
        if !self.active {
            return Some(SkipReason::Inactive);
        }
        if self.identity == IdentityState::Mismatch {
            return Some(SkipReason::IdentityMismatch);
        }
        if !self.identity.allows_capture() {
            return Some(SkipReason::Inactive);
        }
        if self.settings_open {
            return Some(SkipReason::SettingsOpen);
        }
        if self.prompt.as_ref().is_some_and(Prompt::is_blocking) {
            return Some(SkipReason::PromptOpen);
        }
        None
    }

    fn expected_label(&self) -> String {
        self.expected_item
            .clone()
            .unwrap_or_else(|| self.context.category.clone())
    }

    fn current(&self) -> Option<&RepairStep> {
        self.steps.get(self.current_step)
    }

    fn is_last_step(&self) -> bool {
        self.current_step + 1 >= self.steps.len()
    }

    fn guidance_request(&self, frame: &Frame) -> GuidanceRequest {
        let step = self.current();
        GuidanceRequest {
            image_base64: frame.to_base64(),
            mime_type: frame.mime_type.clone(),
            category: self.context.category.clone(),
            problem_description: self.context.problem_description(),
            current_step: self.current_step + 1,
            total_steps: self.steps.len(),
            current_step_instruction: step.map(|s| s.instruction.clone()).unwrap_or_default(),
            step_context: step.map(|s| s.looking_for.clone()).unwrap_or_default(),
            expected_item: self.expected_item.clone(),
        }
    }

    fn question_request(&self, question: &str) -> QuestionRequest {
        QuestionRequest {
            question: question.to_string(),
            category: self.context.category.clone(),
            problem_description: self.context.problem_description(),
            current_step: self.current_step + 1,
            total_steps: self.steps.len(),
            current_step_instruction: self
                .current()
                .map(|s| s.instruction.clone())
                .unwrap_or_default(),
            expected_item: self.expected_item.clone(),
        }
    }
}

/// Releases the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one Guided Fix session.
///
/// Owns the frame timer, both confirmation gates and every user-facing
/// override. All state lives behind a single mutex that is never held across
/// a camera or network await, so the timer always sees the latest state and
/// user actions are serialized with verdict handling.
pub struct SessionController {
    this: Weak<SessionController>,
    guide: Arc<dyn GuidanceClient>,
    planner: Arc<dyn RepairPlanProvider>,
    speech: Arc<dyn SpeechOutput>,
    frames: Arc<dyn FrameSource>,
    options: SessionOptions,
    events: mpsc::UnboundedSender<SessionEvent>,
    in_flight: AtomicBool,
    state: Mutex<SessionState>,
}

impl SessionController {
    pub fn new(
        collaborators: Collaborators,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            guide: collaborators.guide,
            planner: collaborators.planner,
            speech: collaborators.speech,
            frames: collaborators.frames,
            state: Mutex::new(SessionState::new(&options)),
            options,
            events,
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Loads the repair plan, starts identity verification and the frame timer.
    pub async fn start(
        &self,
        category: &str,
        diagnosis_summary: &str,
        likely_cause: Option<&str>,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().await;
            if state.started {
                return Err(SessionError::AlreadyStarted);
            }
            state.started = true;
            state.context = RepairContext {
                category: category.trim().to_string(),
                diagnosis_summary: diagnosis_summary.trim().to_string(),
                likely_cause: likely_cause
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            };
        }

        let request = PlanRequest {
            category: category.to_string(),
            diagnosis_summary: diagnosis_summary.to_string(),
            likely_cause: likely_cause.map(str::to_string),
        };
        tracing::info!("Loading repair plan for '{category}'");
        let plan = match time::timeout(
            self.options.plan_timeout,
            self.planner.generate_repair_plan(&request),
        )
        .await
        {
            Ok(Ok(steps)) if steps.is_empty() => Err("the plan has no steps".to_string()),
            Ok(Ok(steps)) => Ok(steps),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("timed out after {:?}", self.options.plan_timeout)),
        };

        let mut state = self.state.lock().await;
        let steps = match plan {
            Ok(steps) => steps,
            Err(reason) => {
                tracing::error!("Failed to load repair plan: {reason}");
                state.ended = true;
                self.emit(SessionEvent::Error(format!(
                    "Couldn't put together a repair plan: {reason}"
                )));
                self.emit(SessionEvent::SessionEnded(EndReason::PlanUnavailable));
                return Err(SessionError::PlanUnavailable(reason));
            }
        };
        if state.ended {
            tracing::info!("Session was stopped while the plan was loading");
            self.emit(SessionEvent::SessionEnded(EndReason::UserStopped));
            return Err(SessionError::NotActive);
        }

        tracing::info!("Loaded repair plan with {} step(s)", steps.len());
        state.steps = steps;
        state.current_step = 0;
        state.active = true;
        self.set_identity(&mut state, IdentityState::Verifying);
        let category = state.context.category.clone();
        self.announce(
            &mut state,
            &format!(
                "Let's fix your {category}. Point your camera at the {category} so I can make sure we're working on the right thing."
            ),
        );
        self.start_timer(&mut state);
        Ok(())
    }

    /// One timer tick: capture, ask for guidance, apply the verdict.
    ///
    /// Returns immediately when a previous tick is still in flight; ticks are
    /// dropped, never queued.
    pub async fn on_frame(&self) -> FrameOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            tracing::trace!("Frame skipped, previous capture still in flight");
            return FrameOutcome::Skipped(SkipReason::InFlight);
        };

        if let Some(reason) = self.state.lock().await.capture_blocker() {
            return FrameOutcome::Skipped(reason);
        }

        let frame = match self.frames.capture().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("Camera not ready, skipping tick");
                return FrameOutcome::NoFrame;
            }
            Err(CaptureError::PermissionDenied) => {
                self.camera_denied().await;
                return FrameOutcome::NoFrame;
            }
            Err(CaptureError::Other(e)) => {
                tracing::warn!("Frame capture failed: {e:#}");
                return FrameOutcome::NoFrame;
            }
        };

        let (request, generation) = {
            let state = self.state.lock().await;
            if let Some(reason) = state.capture_blocker() {
                return FrameOutcome::Skipped(reason);
            }
            (state.guidance_request(&frame), state.generation)
        };

        let verdict = match time::timeout(
            self.options.guidance_timeout,
            self.guide.get_realtime_guidance(&request),
        )
        .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                tracing::warn!("Guidance call failed: {e:#}");
                return FrameOutcome::NoVerdict;
            }
            Err(_) => {
                tracing::warn!(
                    "Guidance call timed out after {:?}",
                    self.options.guidance_timeout
                );
                return FrameOutcome::NoVerdict;
            }
        };

        self.apply_verdict(verdict, generation).await
    }

    /// Applies a verdict to the current step.
    pub async fn on_guidance_verdict(&self, verdict: GuidanceVerdict) -> FrameOutcome {
        let generation = self.state.lock().await.generation;
        self.apply_verdict(verdict, generation).await
    }

    async fn apply_verdict(&self, verdict: GuidanceVerdict, generation: u64) -> FrameOutcome {
        let mut state = self.state.lock().await;
        if !state.active {
            tracing::debug!("Ignoring verdict, session is no longer active");
            return FrameOutcome::Ignored;
        }
        // A hazard is real no matter which step the request was made for.
        if let Some(warning) = verdict.safety_stop() {
            self.safety_stop(&mut state, warning);
            return FrameOutcome::SafetyStopped;
        }
        if generation != state.generation {
            tracing::debug!("Dropping stale verdict from generation {generation}");
            return FrameOutcome::Stale;
        }
        if !state.identity.allows_capture() {
            return FrameOutcome::Ignored;
        }

        self.process_verdict(&mut state, &verdict);
        FrameOutcome::Applied
    }

    fn process_verdict(&self, state: &mut SessionState, verdict: &GuidanceVerdict) {
        state.highlights = verdict
            .highlights
            .iter()
            .cloned()
            .map(Highlight::clamped)
            .collect();
        self.emit(SessionEvent::HighlightsUpdated(state.highlights.clone()));

        let notice = verdict
            .safety_warning
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty());
        if let Some(notice) = notice {
            if state.last_safety_notice.as_deref() != Some(notice) {
                tracing::warn!("Safety notice: {notice}");
                state.last_safety_notice = Some(notice.to_string());
                self.emit(SessionEvent::SafetyNotice(notice.to_string()));
            }
        }

        match state.identity {
            IdentityState::Verifying => self.verify_identity(state, verdict),
            IdentityState::Confirmed => {
                if !self.check_identity(state, verdict) {
                    return;
                }
                if self.confirm_step(state, verdict.step_complete) {
                    return;
                }
                self.offer_guidance(state, &verdict.instruction);
            }
            IdentityState::Unknown | IdentityState::Mismatch => {}
        }
    }

    fn read_identity(&self, state: &SessionState, verdict: &GuidanceVerdict) -> IdentityRead {
        if verdict.wrong_item {
            let label = verdict.mismatch_label().unwrap_or(UNKNOWN_OBJECT);
            if state.identity_gate.same_item(&state.expected_label(), label) {
                tracing::debug!("Wrong-item flag names the expected item ('{label}'), treating as a match");
                return IdentityRead::Match(label.to_string());
            }
            return IdentityRead::Mismatch(label.to_string());
        }
        match verdict.detected_object() {
            Some(object) => IdentityRead::Match(object.to_string()),
            None => IdentityRead::Nothing,
        }
    }

    fn verify_identity(&self, state: &mut SessionState, verdict: &GuidanceVerdict) {
        match self.read_identity(state, verdict) {
            IdentityRead::Mismatch(label) => {
                state.no_object_frames = 0;
                if !self.register_mismatch(state, &label) {
                    let expected = state.expected_label();
                    self.announce(
                        state,
                        &format!("That looks like a {label}. Point the camera at the {expected}."),
                    );
                }
            }
            IdentityRead::Match(object) => {
                state.identity_gate.record_match();
                state.no_object_frames = 0;
                if state.expected_item.is_none() {
                    state.expected_item = Some(object);
                }
                state.verification_round = false;
                state.failed_verification_rounds = 0;
                if matches!(state.prompt, Some(Prompt::VerifyItem { .. })) {
                    self.close_prompt(state);
                }
                self.set_identity(state, IdentityState::Confirmed);
                self.emit(SessionEvent::Haptic(Haptic::Success));
                let expected = state.expected_label();
                self.announce(state, &format!("Got it, I can see the {expected}."));
                self.schedule_step_announcement(state);
            }
            IdentityRead::Nothing => {
                state.no_object_frames += 1;
                if state.no_object_frames >= self.options.no_object_prompt_after {
                    state.no_object_frames = 0;
                    let expected = state.expected_label();
                    self.announce(
                        state,
                        &format!(
                            "I can't quite make out the {expected}. Try moving closer or adding more light."
                        ),
                    );
                }
            }
        }
    }

    /// Post-verification check. Returns false when the frame shows the wrong
    /// item and must not count toward step progress.
    fn check_identity(&self, state: &mut SessionState, verdict: &GuidanceVerdict) -> bool {
        if state.skip_identity_checks {
            return true;
        }
        match self.read_identity(state, verdict) {
            IdentityRead::Mismatch(label) => {
                if !self.register_mismatch(state, &label) {
                    let expected = state.expected_label();
                    self.offer_guidance(
                        state,
                        &format!("That looks like a {label}. Keep the camera on the {expected}."),
                    );
                }
                false
            }
            IdentityRead::Match(_) | IdentityRead::Nothing => {
                state.identity_gate.record_match();
                true
            }
        }
    }

    /// Returns true when the mismatch run blocked the session.
    fn register_mismatch(&self, state: &mut SessionState, label: &str) -> bool {
        state.detected_item = Some(label.to_string());
        if !state.identity_gate.record_mismatch(label).should_block {
            return false;
        }

        self.stop_timer(state);
        self.set_identity(state, IdentityState::Mismatch);
        let expected = state.expected_label();
        let detected = label.to_string();
        tracing::warn!("Identity mismatch: expected '{expected}', camera shows '{detected}'");

        let mut exhausted = false;
        if state.verification_round {
            state.verification_round = false;
            state.failed_verification_rounds += 1;
            exhausted = state.failed_verification_rounds >= self.options.max_verification_rounds;
        }
        let prompt = if exhausted {
            Prompt::VerificationExhausted {
                expected: expected.clone(),
                detected: detected.clone(),
            }
        } else {
            Prompt::IdentityConflict {
                expected: expected.clone(),
                detected: detected.clone(),
            }
        };

        self.emit(SessionEvent::Haptic(Haptic::Warning));
        self.open_prompt(state, prompt);
        self.announce(
            state,
            &format!("Hold on. This looks like a {detected}, not a {expected}."),
        );
        true
    }

    /// Feeds one frame into the step gate. Returns true when the step was just
    /// confirmed and the confirmation line was spoken.
    fn confirm_step(&self, state: &mut SessionState, complete: bool) -> bool {
        if state.step_state.permits_advance() {
            return false;
        }
        match state.step_gate.record(complete) {
            StepState::Confirmed => {
                state.step_gate.reset();
                self.set_step_state(state, StepState::Confirmed);
                tracing::info!("Step {} confirmed", state.current_step + 1);
                self.emit(SessionEvent::Haptic(Haptic::Success));
                let line = if state.is_last_step() {
                    "Nice, that step looks done. Tap next to finish up."
                } else {
                    "Nice, that step looks done. Tap next when you're ready."
                };
                self.announce(state, line);
                true
            }
            suggestion @ (StepState::InProgress | StepState::PendingConfirmation) => {
                self.set_step_state(state, suggestion);
                false
            }
            StepState::Overridden => false,
        }
    }

    fn safety_stop(&self, state: &mut SessionState, warning: &str) {
        tracing::error!("Safety stop: {warning}");
        state.active = false;
        state.ended = true;
        self.stop_timer(state);
        self.close_prompt(state);
        self.emit(SessionEvent::Haptic(Haptic::Error));

        let text = format!("Stop. {warning}");
        state.guidance_text = text.clone();
        self.emit(SessionEvent::GuidanceUpdated(text.clone()));
        self.speech.stop();
        if let Err(e) = self
            .speech
            .speak(&text, &SpeechOptions::urgent(state.voice))
        {
            tracing::error!("Failed to speak safety warning: {e:#}");
        }
        self.emit(SessionEvent::SessionEnded(EndReason::SafetyStop(
            warning.to_string(),
        )));
    }

    /// Moves to the next step. Only allowed once the current step is
    /// confirmed or overridden; at the last step the session ends instead.
    pub async fn advance_step(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        self.advance_locked(&mut state)
    }

    fn advance_locked(&self, state: &mut SessionState) -> Result<(), SessionError> {
        if !state.step_state.permits_advance() {
            return Err(SessionError::StepNotConfirmed(state.step_state));
        }
        if state.is_last_step() {
            self.finish(state);
            return Ok(());
        }
        state.current_step += 1;
        self.reset_step(state);
        tracing::info!(
            "Advanced to step {}/{}",
            state.current_step + 1,
            state.steps.len()
        );
        self.announce_step(state, None);
        Ok(())
    }

    /// "I did this step" before the camera agreed.
    pub async fn request_advance_without_confirmation(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if state.step_state.permits_advance() {
            return self.advance_locked(&mut state);
        }
        if state.identity != IdentityState::Confirmed && !state.skip_identity_checks {
            return Err(SessionError::IdentityNotConfirmed(state.identity));
        }
        let step = state.current_step;
        self.open_prompt(&mut state, Prompt::StepOverride { step });
        Ok(())
    }

    pub async fn confirm_override(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if !matches!(state.prompt, Some(Prompt::StepOverride { .. })) {
            return Err(SessionError::NoOverridePending);
        }
        if state.identity != IdentityState::Confirmed && !state.skip_identity_checks {
            return Err(SessionError::IdentityNotConfirmed(state.identity));
        }
        self.close_prompt(&mut state);
        tracing::info!("Step {} overridden by the user", state.current_step + 1);
        self.set_step_state(&mut state, StepState::Overridden);
        self.advance_locked(&mut state)
    }

    pub async fn cancel_override(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if !matches!(state.prompt, Some(Prompt::StepOverride { .. })) {
            return Err(SessionError::NoOverridePending);
        }
        self.close_prompt(&mut state);
        Ok(())
    }

    /// Accepts the camera's reading: the detected object becomes the item
    /// under repair and the plan restarts from step 1.
    pub async fn switch_to_detected_item(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if state.identity != IdentityState::Mismatch {
            return Err(SessionError::NoMismatch);
        }
        let detected = state
            .detected_item
            .take()
            .ok_or(SessionError::NoDetectedItem)?;

        tracing::info!(
            "Switching item from {:?} to '{detected}'",
            state.expected_item
        );
        state.expected_item = Some(detected.clone());
        state.identity_gate.reset();
        state.verification_round = false;
        state.failed_verification_rounds = 0;
        state.no_object_frames = 0;
        state.current_step = 0;
        self.reset_step(&mut state);
        self.close_prompt(&mut state);
        self.set_identity(&mut state, IdentityState::Confirmed);
        self.announce_step(
            &mut state,
            Some(&format!("Okay, let's work on the {detected}.")),
        );
        self.start_timer(&mut state);
        Ok(())
    }

    /// Rejects the mismatch and asks for a clearer view. After too many
    /// failed rounds the user gets the retry / continue / exit choice instead.
    pub async fn insist_current_item_correct(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if state.identity != IdentityState::Mismatch {
            return Err(SessionError::NoMismatch);
        }
        if state.failed_verification_rounds >= self.options.max_verification_rounds {
            if !matches!(state.prompt, Some(Prompt::VerificationExhausted { .. })) {
                let prompt = Prompt::VerificationExhausted {
                    expected: state.expected_label(),
                    detected: state
                        .detected_item
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_OBJECT.to_string()),
                };
                self.open_prompt(&mut state, prompt);
            }
            return Ok(());
        }
        self.begin_verification_round(&mut state);
        Ok(())
    }

    /// The "retry" branch once verification rounds are exhausted.
    pub async fn retry_verification(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if state.identity != IdentityState::Mismatch {
            return Err(SessionError::NoMismatch);
        }
        state.failed_verification_rounds = 0;
        self.begin_verification_round(&mut state);
        Ok(())
    }

    fn begin_verification_round(&self, state: &mut SessionState) {
        state.verification_round = true;
        state.identity_gate.reset();
        state.no_object_frames = 0;
        let expected = state.expected_label();
        tracing::info!(
            "Verification round {} for '{expected}'",
            state.failed_verification_rounds + 1
        );
        self.set_identity(state, IdentityState::Verifying);
        self.open_prompt(
            state,
            Prompt::VerifyItem {
                expected: expected.clone(),
            },
        );
        self.announce(
            state,
            &format!(
                "Okay. Show me the {expected} up close, ideally the label or model number."
            ),
        );
        self.start_timer(state);
    }

    /// Trusts the user about the item for the rest of the session. Mismatch
    /// checks stay off from here on.
    pub async fn force_confirm_identity(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        let previous = state.identity;
        state.skip_identity_checks = true;
        state.identity_gate.reset();
        state.verification_round = false;
        state.no_object_frames = 0;
        if matches!(
            state.prompt,
            Some(
                Prompt::IdentityConflict { .. }
                    | Prompt::VerifyItem { .. }
                    | Prompt::VerificationExhausted { .. }
            )
        ) {
            self.close_prompt(&mut state);
        }
        self.set_identity(&mut state, IdentityState::Confirmed);
        tracing::info!("Identity force-confirmed, mismatch checks disabled");
        if previous != IdentityState::Confirmed {
            self.announce_step(&mut state, Some("Okay, I'll trust you on this one."));
        }
        self.start_timer(&mut state);
        Ok(())
    }

    /// Resumes capture after the camera became available again.
    pub async fn resume_capture(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        Self::ensure_active(&state)?;
        if state.identity.allows_capture() {
            self.start_timer(&mut state);
        }
        Ok(())
    }

    /// Ends the session at once: no timer, no speech, late verdicts ignored.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let was_active = state.active;
        state.active = false;
        state.ended = true;
        // Announcements speak under this lock; cut speech before releasing it.
        self.speech.stop();
        self.stop_timer(&mut state);
        if was_active {
            tracing::info!("Session stopped by the user");
            self.emit(SessionEvent::SessionEnded(EndReason::UserStopped));
        }
    }

    pub async fn set_voice_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        state.voice_enabled = enabled;
        if !enabled {
            self.speech.stop();
        }
        tracing::debug!("Narration {}", if enabled { "on" } else { "muted" });
    }

    pub async fn set_voice_settings(&self, voice: VoiceSettings) {
        self.state.lock().await.voice = voice.clamped();
    }

    pub async fn open_settings(&self) {
        self.state.lock().await.settings_open = true;
    }

    pub async fn close_settings(&self) {
        self.state.lock().await.settings_open = false;
    }

    /// Answers a spoken question about the current step and narrates it.
    pub async fn ask_question(&self, question: &str) -> Result<String, SessionError> {
        if !self.options.voice_questions {
            return Err(SessionError::VoiceQuestionsDisabled);
        }
        let request = {
            let state = self.state.lock().await;
            Self::ensure_active(&state)?;
            state.question_request(question)
        };
        tracing::info!("Voice question: \"{question}\"");

        let answer = match time::timeout(
            self.options.guidance_timeout,
            self.guide.answer_question(&request),
        )
        .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return Err(SessionError::QuestionFailed(format!("{e:#}"))),
            Err(_) => return Err(SessionError::QuestionFailed("timed out".to_string())),
        };

        let mut state = self.state.lock().await;
        if state.active {
            self.announce(&mut state, &answer);
        }
        Ok(answer)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            active: state.active,
            identity: state.identity,
            step_state: state.step_state,
            current_step: state.current_step,
            steps: state.steps.clone(),
            expected_item: state.expected_item.clone(),
            detected_item: state.detected_item.clone(),
            identity_checks_skipped: state.skip_identity_checks,
            consecutive_mismatches: state.identity_gate.consecutive_mismatches(),
            confirmation_samples: state.step_gate.len(),
            failed_verification_rounds: state.failed_verification_rounds,
            prompt: state.prompt.clone(),
            settings_open: state.settings_open,
            voice_enabled: state.voice_enabled,
            voice: state.voice,
            guidance_text: state.guidance_text.clone(),
            highlights: state.highlights.clone(),
            timer_running: state.timer.is_some(),
        }
    }

    async fn camera_denied(&self) {
        let mut state = self.state.lock().await;
        if !state.active {
            return;
        }
        tracing::warn!("Camera permission denied, pausing frame capture");
        self.stop_timer(&mut state);
        let message = "Camera access is turned off. Allow it in your device settings, or continue in demo mode without the camera.";
        self.emit(SessionEvent::CameraUnavailable(message.to_string()));
        self.announce(&mut state, message);
    }

    fn finish(&self, state: &mut SessionState) {
        tracing::info!("All {} steps done, session complete", state.steps.len());
        state.active = false;
        state.ended = true;
        self.stop_timer(state);
        self.emit(SessionEvent::Haptic(Haptic::Success));
        self.announce(state, "That was the last step. Nice work! Is it fixed?");
        self.open_prompt(state, Prompt::RepairFinished);
        self.emit(SessionEvent::SessionEnded(EndReason::Completed));
    }

    fn reset_step(&self, state: &mut SessionState) {
        state.generation += 1;
        state.step_gate.reset();
        self.set_step_state(state, StepState::InProgress);
    }

    fn schedule_step_announcement(&self, state: &SessionState) {
        let this = self.this.clone();
        let generation = state.generation;
        let delay = self.options.announce_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            let Some(controller) = this.upgrade() else {
                return;
            };
            let mut state = controller.state.lock().await;
            if !state.active
                || state.generation != generation
                || state.identity != IdentityState::Confirmed
            {
                return;
            }
            controller.announce_step(&mut state, None);
        });
    }

    fn announce_step(&self, state: &mut SessionState, lead_in: Option<&str>) {
        let Some(step) = state.current().cloned() else {
            return;
        };
        let index = state.current_step;
        let total = state.steps.len();
        self.emit(SessionEvent::StepChanged {
            index,
            total,
            instruction: step.instruction.clone(),
        });
        let line = format!("Step {} of {total}: {}", index + 1, step.instruction);
        let text = match lead_in {
            Some(lead_in) => format!("{lead_in} {line}"),
            None => line,
        };
        self.announce(state, &text);
    }

    /// Unthrottled text + speech update. Resets the throttle clock so AI
    /// narration does not immediately talk over it.
    fn announce(&self, state: &mut SessionState, text: &str) {
        state.guidance_text = text.to_string();
        state.last_guidance_at = Some(Instant::now());
        self.emit(SessionEvent::GuidanceUpdated(text.to_string()));
        if !state.voice_enabled {
            return;
        }
        if let Err(e) = self.speech.speak(text, &SpeechOptions::normal(state.voice)) {
            tracing::warn!("Speech failed: {e:#}");
        }
    }

    /// Throttled update for AI-driven guidance.
    fn offer_guidance(&self, state: &mut SessionState, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || text == state.guidance_text {
            return false;
        }
        if let Some(last) = state.last_guidance_at {
            if last.elapsed() < self.options.min_guidance_interval {
                tracing::debug!("Guidance throttled: \"{text}\"");
                return false;
            }
        }
        self.announce(state, text);
        true
    }

    fn start_timer(&self, state: &mut SessionState) {
        if state.timer.is_some() {
            return;
        }
        let this = self.this.clone();
        let period = self.options.frame_interval.max(MIN_FRAME_INTERVAL);
        state.timer = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(controller) = this.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let outcome = controller.on_frame().await;
                    tracing::trace!("Frame tick: {outcome:?}");
                });
            }
        }));
        tracing::debug!("Frame timer started ({period:?})");
    }

    fn stop_timer(&self, state: &mut SessionState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
            tracing::debug!("Frame timer stopped");
        }
    }

    fn set_identity(&self, state: &mut SessionState, identity: IdentityState) {
        if state.identity == identity {
            return;
        }
        tracing::info!("Identity {:?} -> {:?}", state.identity, identity);
        state.identity = identity;
        self.emit(SessionEvent::IdentityChanged(identity));
    }

    fn set_step_state(&self, state: &mut SessionState, step_state: StepState) {
        if state.step_state == step_state {
            return;
        }
        tracing::debug!("Step state {:?} -> {:?}", state.step_state, step_state);
        state.step_state = step_state;
        self.emit(SessionEvent::StepStateChanged(step_state));
    }

    fn open_prompt(&self, state: &mut SessionState, prompt: Prompt) {
        state.prompt = Some(prompt.clone());
        self.emit(SessionEvent::PromptOpened(prompt));
    }

    fn close_prompt(&self, state: &mut SessionState) {
        if state.prompt.take().is_some() {
            self.emit(SessionEvent::PromptClosed);
        }
    }

    fn ensure_active(state: &SessionState) -> Result<(), SessionError> {
        if state.active {
            Ok(())
        } else {
            Err(SessionError::NotActive)
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Session event dropped, no receiver");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}
