use super::*;
use crate::guide::MockRepairPlanProvider;
use crate::speech::MockSpeechOutput;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc::UnboundedReceiver;

// --- Test doubles ---

/// Replays a fixed list of verdicts and tracks how many calls overlap.
#[derive(Default)]
struct ScriptedGuide {
    verdicts: StdMutex<VecDeque<anyhow::Result<GuidanceVerdict>>>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    requests: StdMutex<Vec<GuidanceRequest>>,
}

impl ScriptedGuide {
    fn new(verdicts: Vec<anyhow::Result<GuidanceVerdict>>) -> Self {
        Self {
            verdicts: StdMutex::new(verdicts.into()),
            ..Default::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuidanceClient for ScriptedGuide {
    async fn get_realtime_guidance(
        &self,
        request: &GuidanceRequest,
    ) -> anyhow::Result<GuidanceVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GuidanceVerdict::default()))
    }

    async fn answer_question(&self, request: &QuestionRequest) -> anyhow::Result<String> {
        Ok(format!(
            "For step {}, a basin wrench makes it easier.",
            request.current_step
        ))
    }
}

struct FixedPlanner(Vec<RepairStep>);

#[async_trait]
impl RepairPlanProvider for FixedPlanner {
    async fn generate_repair_plan(&self, _request: &PlanRequest) -> anyhow::Result<Vec<RepairStep>> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Copy)]
enum FakeFrames {
    Ready,
    NotReady,
    Denied,
}

#[async_trait]
impl FrameSource for FakeFrames {
    async fn capture(&self) -> Result<Option<Frame>, CaptureError> {
        match self {
            FakeFrames::Ready => Ok(Some(Frame::jpeg(vec![0xff, 0xd8, 0xff]))),
            FakeFrames::NotReady => Ok(None),
            FakeFrames::Denied => Err(CaptureError::PermissionDenied),
        }
    }
}

#[derive(Default)]
struct RecordingSpeech {
    spoken: StdMutex<Vec<(String, SpeechOptions)>>,
    stops: AtomicUsize,
}

impl RecordingSpeech {
    fn texts(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    fn said(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }
}

impl SpeechOutput for RecordingSpeech {
    fn speak(&self, text: &str, options: &SpeechOptions) -> anyhow::Result<()> {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), *options));
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records whether the session state was locked each time speech was cut.
#[derive(Default)]
struct LockAwareSpeech {
    controller: std::sync::OnceLock<Weak<SessionController>>,
    stops_under_lock: StdMutex<Vec<bool>>,
}

impl SpeechOutput for LockAwareSpeech {
    fn speak(&self, _text: &str, _options: &SpeechOptions) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) {
        let locked = self
            .controller
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|c| c.state.try_lock().is_err());
        self.stops_under_lock.lock().unwrap().push(locked);
    }
}

struct SlowPlanner(Duration);

#[async_trait]
impl RepairPlanProvider for SlowPlanner {
    async fn generate_repair_plan(&self, _request: &PlanRequest) -> anyhow::Result<Vec<RepairStep>> {
        time::sleep(self.0).await;
        Ok(faucet_plan())
    }
}

// --- Helpers ---

struct Harness {
    controller: Arc<SessionController>,
    events: UnboundedReceiver<SessionEvent>,
    guide: Arc<ScriptedGuide>,
    speech: Arc<RecordingSpeech>,
}

impl Harness {
    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn faucet_plan() -> Vec<RepairStep> {
    vec![
        RepairStep::new("Shut off the water supply under the sink", "valve handle turned"),
        RepairStep::new("Remove the faucet handle", "handle removed, cartridge visible"),
        RepairStep::new("Replace the worn washer", "new washer seated"),
    ]
}

fn test_options() -> SessionOptions {
    SessionOptions::default()
        .with_frame_interval(Duration::from_secs(3600))
        .with_announce_delay(Duration::from_secs(1))
        .with_min_guidance_interval(Duration::ZERO)
}

fn harness_with(guide: ScriptedGuide, frames: FakeFrames, options: SessionOptions) -> Harness {
    let guide = Arc::new(guide);
    let speech = Arc::new(RecordingSpeech::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: guide.clone(),
            planner: Arc::new(FixedPlanner(faucet_plan())),
            speech: speech.clone(),
            frames: Arc::new(frames),
        },
        options,
        tx,
    );
    Harness {
        controller,
        events: rx,
        guide,
        speech,
    }
}

async fn started_with(guide: ScriptedGuide, frames: FakeFrames, options: SessionOptions) -> Harness {
    let h = harness_with(guide, frames, options);
    h.controller
        .start("faucet", "The kitchen faucet drips constantly.", Some("worn washer"))
        .await
        .expect("session should start");
    h
}

async fn started() -> Harness {
    started_with(ScriptedGuide::default(), FakeFrames::Ready, test_options()).await
}

/// A started session whose identity is already confirmed.
async fn confirmed() -> Harness {
    let h = started().await;
    assert_eq!(
        h.controller.on_guidance_verdict(seen("faucet")).await,
        FrameOutcome::Applied
    );
    h
}

fn seen(object: &str) -> GuidanceVerdict {
    GuidanceVerdict {
        detected_object: Some(object.to_string()),
        ..Default::default()
    }
}

fn wrong(label: &str) -> GuidanceVerdict {
    GuidanceVerdict {
        wrong_item: true,
        detected_item_mismatch: Some(label.to_string()),
        ..Default::default()
    }
}

fn complete(done: bool) -> GuidanceVerdict {
    GuidanceVerdict {
        instruction: "Keep going".to_string(),
        step_complete: done,
        ..Default::default()
    }
}

// --- Start ---

#[tokio::test]
async fn test_start_enters_verification_and_starts_timer() {
    let mut h = started().await;

    let snap = h.controller.snapshot().await;
    assert!(snap.active);
    assert_eq!(snap.identity, IdentityState::Verifying);
    assert_eq!(snap.step_state, StepState::InProgress);
    assert_eq!(snap.steps.len(), 3);
    assert!(snap.timer_running);
    assert!(h.speech.said("Point your camera at the faucet"));
    assert!(
        h.drain()
            .contains(&SessionEvent::IdentityChanged(IdentityState::Verifying))
    );
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = started().await;
    let err = h
        .controller
        .start("faucet", "drips", None)
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::AlreadyStarted);
}

#[tokio::test]
async fn test_plan_failure_ends_session() {
    let mut planner = MockRepairPlanProvider::new();
    planner
        .expect_generate_repair_plan()
        .returning(|_| Err(anyhow::anyhow!("service unavailable")))
        .once();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: Arc::new(ScriptedGuide::default()),
            planner: Arc::new(planner),
            speech: Arc::new(RecordingSpeech::default()),
            frames: Arc::new(FakeFrames::Ready),
        },
        test_options(),
        tx,
    );

    let err = controller.start("faucet", "drips", None).await.unwrap_err();
    assert!(matches!(err, SessionError::PlanUnavailable(ref reason) if reason.contains("service unavailable")));

    let snap = controller.snapshot().await;
    assert!(!snap.active);
    assert!(!snap.timer_running);

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::SessionEnded(EndReason::PlanUnavailable))
    );
}

#[tokio::test]
async fn test_empty_plan_is_a_plan_failure() {
    let mut planner = MockRepairPlanProvider::new();
    planner
        .expect_generate_repair_plan()
        .returning(|_| Ok(vec![]));

    let (tx, _rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: Arc::new(ScriptedGuide::default()),
            planner: Arc::new(planner),
            speech: Arc::new(RecordingSpeech::default()),
            frames: Arc::new(FakeFrames::Ready),
        },
        test_options(),
        tx,
    );

    let err = controller.start("faucet", "drips", None).await.unwrap_err();
    assert!(matches!(err, SessionError::PlanUnavailable(_)));
}

// --- Identity ---

#[tokio::test(start_paused = true)]
async fn test_faucet_scenario_confirms_identity_and_announces_step_one() {
    let guide = ScriptedGuide::new(vec![Ok(seen("faucet"))]);
    let mut h = started_with(guide, FakeFrames::Ready, test_options()).await;

    assert_eq!(h.controller.on_frame().await, FrameOutcome::Applied);

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.expected_item.as_deref(), Some("faucet"));
    assert!(h.speech.said("I can see the faucet"));
    assert!(!h.speech.said("Step 1 of 3"), "step 1 waits for the delay");

    time::sleep(Duration::from_secs(2)).await;

    assert!(h.speech.said("Step 1 of 3: Shut off the water supply"));
    let events = h.drain();
    assert!(events.contains(&SessionEvent::IdentityChanged(IdentityState::Confirmed)));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::StepChanged { index: 0, total: 3, .. }
    )));
}

#[tokio::test]
async fn test_request_carries_step_context() {
    let guide = ScriptedGuide::new(vec![Ok(seen("faucet"))]);
    let h = started_with(guide, FakeFrames::Ready, test_options()).await;

    h.controller.on_frame().await;

    let requests = h.guide.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.category, "faucet");
    assert_eq!(request.current_step, 1);
    assert_eq!(request.total_steps, 3);
    assert_eq!(request.step_context, "valve handle turned");
    assert_eq!(request.image_base64, "/9j/");
    assert!(request.problem_description.contains("Likely cause: worn washer"));
    assert_eq!(request.expected_item, None);
}

#[tokio::test]
async fn test_two_consecutive_wrong_items_block_after_confirmation() {
    let mut h = confirmed().await;
    h.drain();

    h.controller.on_guidance_verdict(wrong("toaster")).await;
    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.consecutive_mismatches, 1);
    assert!(snap.timer_running);

    h.controller.on_guidance_verdict(wrong("toaster")).await;
    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Mismatch);
    assert!(!snap.timer_running);
    assert_eq!(snap.detected_item.as_deref(), Some("toaster"));
    assert_eq!(
        snap.prompt,
        Some(Prompt::IdentityConflict {
            expected: "faucet".to_string(),
            detected: "toaster".to_string(),
        })
    );

    let events = h.drain();
    assert!(events.contains(&SessionEvent::Haptic(Haptic::Warning)));
    assert!(h.speech.said("This looks like a toaster, not a faucet"));
}

#[tokio::test]
async fn test_clean_frame_between_mismatches_resets_count() {
    let h = confirmed().await;

    h.controller.on_guidance_verdict(wrong("toaster")).await;
    h.controller.on_guidance_verdict(complete(false)).await;
    h.controller.on_guidance_verdict(wrong("toaster")).await;

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.consecutive_mismatches, 1);
}

#[tokio::test]
async fn test_wrong_item_frames_do_not_count_toward_step() {
    let h = confirmed().await;

    h.controller
        .on_guidance_verdict(GuidanceVerdict {
            step_complete: true,
            ..wrong("toaster")
        })
        .await;

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.confirmation_samples, 0);
    assert_eq!(snap.step_state, StepState::InProgress);
}

#[tokio::test]
async fn test_wrong_item_naming_expected_item_counts_as_match() {
    let h = confirmed().await;

    h.controller.on_guidance_verdict(wrong("Faucet")).await;
    h.controller.on_guidance_verdict(wrong("faucets")).await;

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.consecutive_mismatches, 0);
}

#[tokio::test]
async fn test_wrong_item_contained_in_expected_label_still_blocks() {
    let h = harness_with(ScriptedGuide::default(), FakeFrames::Ready, test_options());
    h.controller
        .start("dishwasher", "It won't drain.", None)
        .await
        .expect("session should start");
    h.controller.on_guidance_verdict(seen("dishwasher")).await;
    assert_eq!(h.controller.snapshot().await.identity, IdentityState::Confirmed);

    h.controller.on_guidance_verdict(wrong("washer")).await;
    h.controller.on_guidance_verdict(wrong("washer")).await;

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Mismatch);
    assert_eq!(snap.detected_item.as_deref(), Some("washer"));
}

#[tokio::test]
async fn test_mismatch_while_verifying_reannounces_then_blocks() {
    let h = started().await;

    h.controller.on_guidance_verdict(wrong("toaster")).await;
    assert_eq!(
        h.controller.snapshot().await.identity,
        IdentityState::Verifying
    );
    assert!(h.speech.said("That looks like a toaster. Point the camera at the faucet."));

    h.controller.on_guidance_verdict(wrong("toaster")).await;
    assert_eq!(
        h.controller.snapshot().await.identity,
        IdentityState::Mismatch
    );
}

#[tokio::test]
async fn test_no_object_prompts_camera_adjustment_without_mismatch() {
    let h = started().await;

    for _ in 0..2 {
        h.controller
            .on_guidance_verdict(GuidanceVerdict::default())
            .await;
    }
    assert!(!h.speech.said("can't quite make out"));

    h.controller
        .on_guidance_verdict(GuidanceVerdict::default())
        .await;

    let snap = h.controller.snapshot().await;
    assert!(h.speech.said("I can't quite make out the faucet"));
    assert_eq!(snap.identity, IdentityState::Verifying);
    assert_eq!(snap.consecutive_mismatches, 0);
}

#[tokio::test]
async fn test_switch_to_detected_item_restarts_plan() {
    let h = confirmed().await;
    h.controller.on_guidance_verdict(complete(true)).await;
    h.controller.on_guidance_verdict(complete(true)).await;
    h.controller.advance_step().await.unwrap();
    h.controller.on_guidance_verdict(wrong("bathroom sink")).await;
    h.controller.on_guidance_verdict(wrong("bathroom sink")).await;

    h.controller.switch_to_detected_item().await.unwrap();

    let snap = h.controller.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.expected_item.as_deref(), Some("bathroom sink"));
    assert_eq!(snap.current_step, 0);
    assert_eq!(snap.step_state, StepState::InProgress);
    assert_eq!(snap.prompt, None);
    assert!(snap.timer_running);
    assert!(h.speech.said("let's work on the bathroom sink. Step 1 of 3"));
}

#[tokio::test]
async fn test_switch_requires_mismatch() {
    let h = confirmed().await;
    assert_eq!(
        h.controller.switch_to_detected_item().await.unwrap_err(),
        SessionError::NoMismatch
    );
}

#[tokio::test]
async fn test_insist_rounds_are_bounded() {
    let h = confirmed().await;
    let c = &h.controller;
    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;

    // Round 1 fails.
    c.insist_current_item_correct().await.unwrap();
    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Verifying);
    assert!(matches!(snap.prompt, Some(Prompt::VerifyItem { .. })));
    assert!(snap.timer_running);
    assert!(h.speech.said("label or model number"));
    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;
    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Mismatch);
    assert_eq!(snap.failed_verification_rounds, 1);
    assert!(matches!(snap.prompt, Some(Prompt::IdentityConflict { .. })));

    // Round 2 fails and exhausts verification.
    c.insist_current_item_correct().await.unwrap();
    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;
    let snap = c.snapshot().await;
    assert_eq!(snap.failed_verification_rounds, 2);
    assert!(matches!(
        snap.prompt,
        Some(Prompt::VerificationExhausted { .. })
    ));

    // Insisting again does not start a third round.
    c.insist_current_item_correct().await.unwrap();
    assert_eq!(c.snapshot().await.identity, IdentityState::Mismatch);

    // Retry starts a fresh round.
    c.retry_verification().await.unwrap();
    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Verifying);
    assert_eq!(snap.failed_verification_rounds, 0);
}

#[tokio::test]
async fn test_successful_verification_round_confirms() {
    let h = confirmed().await;
    let c = &h.controller;
    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;
    c.insist_current_item_correct().await.unwrap();

    c.on_guidance_verdict(seen("faucet")).await;

    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.prompt, None);
    assert_eq!(snap.expected_item.as_deref(), Some("faucet"));
}

#[tokio::test]
async fn test_force_confirm_is_sticky() {
    let h = confirmed().await;
    let c = &h.controller;
    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;

    c.force_confirm_identity().await.unwrap();
    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert!(snap.identity_checks_skipped);
    assert!(snap.timer_running);
    assert_eq!(snap.prompt, None);

    for _ in 0..4 {
        c.on_guidance_verdict(wrong("toaster")).await;
    }
    let snap = c.snapshot().await;
    assert_eq!(snap.identity, IdentityState::Confirmed);
    assert_eq!(snap.consecutive_mismatches, 0);

    // Step progress still counts on frames the model flags.
    c.on_guidance_verdict(GuidanceVerdict {
        step_complete: true,
        ..wrong("toaster")
    })
    .await;
    assert_eq!(
        c.snapshot().await.step_state,
        StepState::PendingConfirmation
    );
}

// --- Step confirmation ---

#[tokio::test]
async fn test_step_confirms_on_second_positive_frame() {
    let mut h = confirmed().await;
    h.drain();

    h.controller.on_guidance_verdict(complete(true)).await;
    assert_eq!(
        h.controller.snapshot().await.step_state,
        StepState::PendingConfirmation
    );

    h.controller.on_guidance_verdict(complete(true)).await;
    let snap = h.controller.snapshot().await;
    assert_eq!(snap.step_state, StepState::Confirmed);
    assert_eq!(snap.confirmation_samples, 0);

    let events = h.drain();
    assert!(events.contains(&SessionEvent::StepStateChanged(StepState::PendingConfirmation)));
    assert!(events.contains(&SessionEvent::StepStateChanged(StepState::Confirmed)));
    assert!(events.contains(&SessionEvent::Haptic(Haptic::Success)));
    assert!(h.speech.said("that step looks done"));
}

#[tokio::test]
async fn test_noisy_frame_still_confirms_by_majority() {
    let h = confirmed().await;
    for done in [true, false, true] {
        h.controller.on_guidance_verdict(complete(done)).await;
    }
    assert_eq!(
        h.controller.snapshot().await.step_state,
        StepState::Confirmed
    );
}

#[tokio::test]
async fn test_steps_do_not_progress_before_identity_confirmed() {
    let h = started().await;
    for _ in 0..3 {
        h.controller
            .on_guidance_verdict(GuidanceVerdict {
                step_complete: true,
                ..Default::default()
            })
            .await;
    }
    let snap = h.controller.snapshot().await;
    assert_eq!(snap.step_state, StepState::InProgress);
    assert_eq!(snap.confirmation_samples, 0);
}

#[tokio::test]
async fn test_advance_requires_confirmation() {
    let h = confirmed().await;
    h.controller.on_guidance_verdict(complete(true)).await;

    let err = h.controller.advance_step().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::StepNotConfirmed(StepState::PendingConfirmation)
    );
    assert_eq!(h.controller.snapshot().await.current_step, 0);
}

#[tokio::test]
async fn test_step_change_resets_state_and_window() {
    let h = confirmed().await;
    let c = &h.controller;
    c.on_guidance_verdict(complete(true)).await;
    assert_eq!(c.snapshot().await.confirmation_samples, 1);

    c.request_advance_without_confirmation().await.unwrap();
    assert_eq!(
        c.snapshot().await.prompt,
        Some(Prompt::StepOverride { step: 0 })
    );
    c.confirm_override().await.unwrap();

    let snap = c.snapshot().await;
    assert_eq!(snap.current_step, 1);
    assert_eq!(snap.step_state, StepState::InProgress);
    assert_eq!(snap.confirmation_samples, 0);
    assert_eq!(snap.prompt, None);
    assert!(h.speech.said("Step 2 of 3: Remove the faucet handle"));
}

#[tokio::test]
async fn test_override_cancel_keeps_step() {
    let h = confirmed().await;
    let c = &h.controller;
    c.request_advance_without_confirmation().await.unwrap();
    c.cancel_override().await.unwrap();

    let snap = c.snapshot().await;
    assert_eq!(snap.current_step, 0);
    assert_eq!(snap.prompt, None);
    assert_eq!(
        c.confirm_override().await.unwrap_err(),
        SessionError::NoOverridePending
    );
}

#[tokio::test]
async fn test_override_requires_confirmed_identity() {
    let h = started().await;
    assert_eq!(
        h.controller
            .request_advance_without_confirmation()
            .await
            .unwrap_err(),
        SessionError::IdentityNotConfirmed(IdentityState::Verifying)
    );
}

#[tokio::test]
async fn test_advancing_past_last_step_ends_session() {
    let mut h = confirmed().await;
    let c = &h.controller;

    for expected_index in 0..3 {
        assert_eq!(c.snapshot().await.current_step, expected_index);
        c.request_advance_without_confirmation().await.unwrap();
        c.confirm_override().await.unwrap();
    }

    let snap = c.snapshot().await;
    assert_eq!(snap.current_step, 2, "index never leaves the plan");
    assert!(!snap.active);
    assert!(!snap.timer_running);
    assert_eq!(snap.prompt, Some(Prompt::RepairFinished));
    assert!(h.speech.said("That was the last step"));
    assert!(
        h.drain()
            .contains(&SessionEvent::SessionEnded(EndReason::Completed))
    );
    assert_eq!(
        h.controller.advance_step().await.unwrap_err(),
        SessionError::NotActive
    );
}

// --- Throttle and highlights ---

#[tokio::test(start_paused = true)]
async fn test_guidance_text_is_throttled_but_highlights_are_not() {
    let options = test_options().with_min_guidance_interval(Duration::from_secs(10));
    let h = started_with(ScriptedGuide::default(), FakeFrames::Ready, options).await;
    let c = &h.controller;
    c.on_guidance_verdict(seen("faucet")).await;
    time::sleep(Duration::from_secs(12)).await;

    c.on_guidance_verdict(GuidanceVerdict {
        instruction: "Turn the valve clockwise".to_string(),
        ..Default::default()
    })
    .await;
    assert_eq!(c.snapshot().await.guidance_text, "Turn the valve clockwise");

    c.on_guidance_verdict(GuidanceVerdict {
        instruction: "Now loosen the handle screw".to_string(),
        highlights: vec![Highlight {
            label: "screw".to_string(),
            x: 40.0,
            y: 40.0,
            width: 10.0,
            height: 10.0,
        }],
        ..Default::default()
    })
    .await;
    let snap = c.snapshot().await;
    assert_eq!(snap.guidance_text, "Turn the valve clockwise");
    assert_eq!(snap.highlights.len(), 1);
    assert_eq!(snap.highlights[0].label, "screw");
    assert!(!h.speech.said("loosen the handle screw"));

    time::sleep(Duration::from_secs(11)).await;
    c.on_guidance_verdict(GuidanceVerdict {
        instruction: "Now loosen the handle screw".to_string(),
        ..Default::default()
    })
    .await;
    assert_eq!(
        c.snapshot().await.guidance_text,
        "Now loosen the handle screw"
    );
}

#[tokio::test(start_paused = true)]
async fn test_muted_narration_still_updates_text() {
    let h = confirmed().await;
    h.controller.set_voice_enabled(false).await;
    let spoken_before = h.speech.texts().len();

    h.controller
        .on_guidance_verdict(GuidanceVerdict {
            instruction: "Turn the valve clockwise".to_string(),
            ..Default::default()
        })
        .await;

    assert_eq!(
        h.controller.snapshot().await.guidance_text,
        "Turn the valve clockwise"
    );
    assert_eq!(h.speech.texts().len(), spoken_before);
    assert!(h.speech.stops.load(Ordering::SeqCst) >= 1);
}

// --- Safety ---

#[tokio::test]
async fn test_safety_stop_is_absolute_and_bypasses_mute() {
    let mut speech = MockSpeechOutput::new();
    speech.expect_stop().returning(|| ());
    speech
        .expect_speak()
        .withf(|text, options| options.urgent && text.contains("outlet"))
        .times(1)
        .returning(|_, _| Ok(()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: Arc::new(ScriptedGuide::default()),
            planner: Arc::new(FixedPlanner(faucet_plan())),
            speech: Arc::new(speech),
            frames: Arc::new(FakeFrames::Ready),
        },
        test_options().with_voice_enabled(false),
        tx,
    );
    controller.start("faucet", "drips", None).await.unwrap();
    controller.on_guidance_verdict(seen("faucet")).await;
    controller.on_guidance_verdict(complete(true)).await;
    controller.on_guidance_verdict(wrong("toaster")).await;
    let before = controller.snapshot().await;

    let outcome = controller
        .on_guidance_verdict(GuidanceVerdict {
            should_stop: true,
            safety_warning: Some("Water is pooling near the outlet.".to_string()),
            step_complete: true,
            wrong_item: true,
            detected_item_mismatch: Some("toaster".to_string()),
            ..Default::default()
        })
        .await;

    assert_eq!(outcome, FrameOutcome::SafetyStopped);
    let after = controller.snapshot().await;
    assert!(!after.active);
    assert!(!after.timer_running);
    assert_eq!(after.identity, before.identity);
    assert_eq!(after.step_state, before.step_state);
    assert_eq!(after.consecutive_mismatches, before.consecutive_mismatches);
    assert_eq!(after.confirmation_samples, before.confirmation_samples);

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert_eq!(
        events.last(),
        Some(&SessionEvent::SessionEnded(EndReason::SafetyStop(
            "Water is pooling near the outlet.".to_string()
        )))
    );
}

#[tokio::test]
async fn test_safety_stop_closes_open_prompt() {
    let mut h = confirmed().await;
    h.controller
        .request_advance_without_confirmation()
        .await
        .unwrap();
    h.drain();

    h.controller
        .on_guidance_verdict(GuidanceVerdict {
            should_stop: true,
            safety_warning: Some("Sparks near the cord".to_string()),
            ..Default::default()
        })
        .await;

    assert_eq!(h.controller.snapshot().await.prompt, None);
    assert!(h.drain().contains(&SessionEvent::PromptClosed));
}

#[tokio::test]
async fn test_safety_stop_applies_during_mismatch() {
    let h = confirmed().await;
    h.controller.on_guidance_verdict(wrong("toaster")).await;
    h.controller.on_guidance_verdict(wrong("toaster")).await;

    let outcome = h
        .controller
        .on_guidance_verdict(GuidanceVerdict {
            should_stop: true,
            safety_warning: Some("Sparks near the cord".to_string()),
            ..Default::default()
        })
        .await;

    assert_eq!(outcome, FrameOutcome::SafetyStopped);
    assert!(!h.controller.snapshot().await.active);
}

#[tokio::test]
async fn test_stop_without_warning_is_not_a_safety_stop() {
    let h = confirmed().await;
    let outcome = h
        .controller
        .on_guidance_verdict(GuidanceVerdict {
            should_stop: true,
            ..Default::default()
        })
        .await;
    assert_eq!(outcome, FrameOutcome::Applied);
    assert!(h.controller.snapshot().await.active);
}

#[tokio::test]
async fn test_non_blocking_safety_notice_is_reported_once() {
    let mut h = confirmed().await;
    h.drain();
    let verdict = GuidanceVerdict {
        safety_warning: Some("Wear gloves, the edges are sharp".to_string()),
        ..Default::default()
    };

    h.controller.on_guidance_verdict(verdict.clone()).await;
    h.controller.on_guidance_verdict(verdict).await;

    let notices = h
        .drain()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SafetyNotice(_)))
        .count();
    assert_eq!(notices, 1);
    assert!(h.controller.snapshot().await.active);
}

// --- Frame pipeline ---

#[tokio::test(start_paused = true)]
async fn test_no_concurrent_captures() {
    let guide = ScriptedGuide::new(vec![Ok(seen("faucet"))]).with_delay(Duration::from_secs(5));
    let h = started_with(guide, FakeFrames::Ready, test_options()).await;
    let c = &h.controller;

    let (a, b, d) = tokio::join!(c.on_frame(), c.on_frame(), c.on_frame());
    let outcomes = [a, b, d];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == FrameOutcome::Skipped(SkipReason::InFlight))
            .count(),
        2
    );
    assert!(outcomes.contains(&FrameOutcome::Applied));
    assert_eq!(h.guide.calls(), 1);
    assert_eq!(h.guide.max_active.load(Ordering::SeqCst), 1);

    // The guard is released once the tick finishes.
    assert_eq!(c.on_frame().await, FrameOutcome::Applied);
    assert_eq!(h.guide.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_drives_frames() {
    let options = test_options().with_frame_interval(Duration::from_secs(3));
    let guide = ScriptedGuide::new(vec![Ok(seen("faucet"))]);
    let h = started_with(guide, FakeFrames::Ready, options).await;
    assert_eq!(h.guide.calls(), 0, "first capture waits one period");

    time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(h.guide.calls(), 1);
    assert_eq!(
        h.controller.snapshot().await.identity,
        IdentityState::Confirmed
    );
}

#[tokio::test]
async fn test_frames_skipped_while_blocked() {
    let h = confirmed().await;
    let c = &h.controller;

    c.open_settings().await;
    assert_eq!(
        c.on_frame().await,
        FrameOutcome::Skipped(SkipReason::SettingsOpen)
    );
    c.close_settings().await;

    c.request_advance_without_confirmation().await.unwrap();
    assert_eq!(
        c.on_frame().await,
        FrameOutcome::Skipped(SkipReason::PromptOpen)
    );
    c.cancel_override().await.unwrap();

    c.on_guidance_verdict(wrong("toaster")).await;
    c.on_guidance_verdict(wrong("toaster")).await;
    assert_eq!(
        c.on_frame().await,
        FrameOutcome::Skipped(SkipReason::IdentityMismatch)
    );
    assert_eq!(h.guide.calls(), 0);
}

#[tokio::test]
async fn test_guidance_failure_is_absorbed() {
    let guide = ScriptedGuide::new(vec![
        Err(anyhow::anyhow!("502 bad gateway")),
        Ok(seen("faucet")),
    ]);
    let h = started_with(guide, FakeFrames::Ready, test_options()).await;

    assert_eq!(h.controller.on_frame().await, FrameOutcome::NoVerdict);
    let snap = h.controller.snapshot().await;
    assert!(snap.active);
    assert!(snap.timer_running);
    assert_eq!(snap.identity, IdentityState::Verifying);
    assert_eq!(snap.consecutive_mismatches, 0);

    assert_eq!(h.controller.on_frame().await, FrameOutcome::Applied);
    assert_eq!(
        h.controller.snapshot().await.identity,
        IdentityState::Confirmed
    );
}

#[tokio::test(start_paused = true)]
async fn test_guidance_timeout_releases_guard() {
    let guide = ScriptedGuide::new(vec![]).with_delay(Duration::from_secs(120));
    let options = test_options().with_guidance_timeout(Duration::from_secs(5));
    let h = started_with(guide, FakeFrames::Ready, options).await;

    assert_eq!(h.controller.on_frame().await, FrameOutcome::NoVerdict);
    assert!(!h.controller.in_flight.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_camera_not_ready_is_a_skipped_tick() {
    let h = started_with(ScriptedGuide::default(), FakeFrames::NotReady, test_options()).await;
    assert_eq!(h.controller.on_frame().await, FrameOutcome::NoFrame);
    assert_eq!(h.guide.calls(), 0);
    assert!(h.controller.snapshot().await.timer_running);
}

#[tokio::test]
async fn test_camera_permission_denied_is_surfaced() {
    let mut h = started_with(ScriptedGuide::default(), FakeFrames::Denied, test_options()).await;

    assert_eq!(h.controller.on_frame().await, FrameOutcome::NoFrame);

    let snap = h.controller.snapshot().await;
    assert!(snap.active);
    assert!(!snap.timer_running);
    assert!(
        h.drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::CameraUnavailable(msg) if msg.contains("demo mode")))
    );

    h.controller.resume_capture().await.unwrap();
    assert!(h.controller.snapshot().await.timer_running);
}

#[tokio::test(start_paused = true)]
async fn test_verdict_for_previous_step_is_discarded() {
    let guide = ScriptedGuide::new(vec![Ok(complete(true))]).with_delay(Duration::from_secs(2));
    let h = started_with(guide, FakeFrames::Ready, test_options()).await;
    h.controller.on_guidance_verdict(seen("faucet")).await;

    let controller = h.controller.clone();
    let tick = tokio::spawn(async move { controller.on_frame().await });
    time::sleep(Duration::from_millis(100)).await;

    h.controller
        .request_advance_without_confirmation()
        .await
        .unwrap();
    h.controller.confirm_override().await.unwrap();

    assert_eq!(tick.await.unwrap(), FrameOutcome::Stale);
    let snap = h.controller.snapshot().await;
    assert_eq!(snap.current_step, 1);
    assert_eq!(snap.confirmation_samples, 0);
}

// --- Stop and user settings ---

#[tokio::test]
async fn test_stop_cancels_everything_and_ignores_late_verdicts() {
    let mut h = confirmed().await;

    h.controller.stop().await;

    let snap = h.controller.snapshot().await;
    assert!(!snap.active);
    assert!(!snap.timer_running);
    assert!(h.speech.stops.load(Ordering::SeqCst) >= 1);
    assert!(
        h.drain()
            .contains(&SessionEvent::SessionEnded(EndReason::UserStopped))
    );

    assert_eq!(
        h.controller.on_guidance_verdict(complete(true)).await,
        FrameOutcome::Ignored
    );
    assert_eq!(
        h.controller.on_frame().await,
        FrameOutcome::Skipped(SkipReason::Inactive)
    );

    // Stopping twice is harmless.
    h.controller.stop().await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_stop_cuts_speech_while_holding_state() {
    let speech = Arc::new(LockAwareSpeech::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: Arc::new(ScriptedGuide::default()),
            planner: Arc::new(FixedPlanner(faucet_plan())),
            speech: speech.clone(),
            frames: Arc::new(FakeFrames::Ready),
        },
        test_options(),
        tx,
    );
    let _ = speech.controller.set(Arc::downgrade(&controller));
    controller.start("faucet", "drips", None).await.unwrap();

    controller.stop().await;

    assert_eq!(*speech.stops_under_lock.lock().unwrap(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_plan_load_reports_session_end() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Collaborators {
            guide: Arc::new(ScriptedGuide::default()),
            planner: Arc::new(SlowPlanner(Duration::from_secs(5))),
            speech: Arc::new(RecordingSpeech::default()),
            frames: Arc::new(FakeFrames::Ready),
        },
        test_options(),
        tx,
    );

    let starting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start("faucet", "drips", None).await })
    };
    time::sleep(Duration::from_secs(1)).await;
    controller.stop().await;

    assert_eq!(starting.await.unwrap(), Err(SessionError::NotActive));
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert_eq!(
        events,
        vec![SessionEvent::SessionEnded(EndReason::UserStopped)]
    );
    assert!(!controller.snapshot().await.timer_running);
}

#[tokio::test]
async fn test_voice_settings_are_clamped_and_used() {
    let h = confirmed().await;
    h.controller
        .set_voice_settings(VoiceSettings {
            rate: 9.0,
            pitch: 1.2,
        })
        .await;
    h.controller.on_guidance_verdict(complete(true)).await;
    h.controller.on_guidance_verdict(complete(true)).await;

    let spoken = h.speech.spoken.lock().unwrap().clone();
    let (_, options) = spoken.last().unwrap();
    assert_eq!(options.rate, crate::speech::MAX_RATE);
    assert_eq!(options.pitch, 1.2);
}

#[tokio::test]
async fn test_voice_questions_respect_option() {
    let h = confirmed().await;
    assert_eq!(
        h.controller.ask_question("Do I need a wrench?").await.unwrap_err(),
        SessionError::VoiceQuestionsDisabled
    );

    let options = test_options().with_voice_questions(true);
    let h = started_with(ScriptedGuide::default(), FakeFrames::Ready, options).await;
    let answer = h
        .controller
        .ask_question("Do I need a wrench?")
        .await
        .unwrap();
    assert!(answer.contains("basin wrench"));
    assert!(h.speech.said("basin wrench"));
}
