use crate::types::StepState;
use std::collections::VecDeque;

pub const CONFIRMATION_WINDOW: usize = 3;
pub const CONFIRMATIONS_REQUIRED: usize = 2;

/// Sliding-window vote over recent `step_complete` flags.
///
/// A majority of the last three frames confirms a step, so one blurry or
/// occluded frame does not reset progress.
#[derive(Debug, Clone)]
pub struct StepConfirmationGate {
    window: VecDeque<bool>,
    capacity: usize,
    required: usize,
}

impl Default for StepConfirmationGate {
    fn default() -> Self {
        Self::new(CONFIRMATION_WINDOW, CONFIRMATIONS_REQUIRED)
    }
}

impl StepConfirmationGate {
    pub fn new(capacity: usize, required: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            required: required.clamp(1, capacity),
        }
    }

    /// Records one frame and suggests the step state it implies.
    pub fn record(&mut self, complete: bool) -> StepState {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(complete);

        if self.is_confirmed() {
            StepState::Confirmed
        } else if self.is_pending() {
            StepState::PendingConfirmation
        } else {
            StepState::InProgress
        }
    }

    /// At least `required` of the recorded samples are positive.
    pub fn is_confirmed(&self) -> bool {
        self.positives() >= self.required
    }

    /// Some positive sample, not yet a majority.
    pub fn is_pending(&self) -> bool {
        self.positives() > 0 && !self.is_confirmed()
    }

    pub fn positives(&self) -> usize {
        self.window.iter().filter(|&&c| c).count()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
