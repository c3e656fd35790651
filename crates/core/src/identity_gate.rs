use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

/// Consecutive wrong-item reads before the session blocks.
pub const DEFAULT_MISMATCH_THRESHOLD: u32 = 2;

// Minimum skim score per pattern character for two labels to count as the
// same object.
const SAME_ITEM_SCORE_PER_CHAR: i64 = 14;
// Fuzzy matching only tolerates small spelling differences.
const SAME_ITEM_MAX_EXTRA_CHARS: usize = 2;
const SAME_ITEM_MIN_FUZZY_CHARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MismatchOutcome {
    pub should_block: bool,
    pub consecutive: u32,
}

/// Counts consecutive wrong-item reads.
///
/// The policy is "two consecutive disagreements": any match in between
/// resets the count.
pub struct IdentityGate {
    threshold: u32,
    consecutive: u32,
    last_label: Option<String>,
    matcher: SkimMatcherV2,
}

impl Default for IdentityGate {
    fn default() -> Self {
        Self::new(DEFAULT_MISMATCH_THRESHOLD)
    }
}

impl IdentityGate {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            last_label: None,
            matcher: SkimMatcherV2::default(),
        }
    }

    pub fn record_match(&mut self) {
        if self.consecutive > 0 {
            tracing::debug!(
                "Identity match after {} mismatch(es), resetting",
                self.consecutive
            );
        }
        self.consecutive = 0;
        self.last_label = None;
    }

    pub fn record_mismatch(&mut self, label: &str) -> MismatchOutcome {
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_label = Some(label.to_string());
        let should_block = self.consecutive >= self.threshold;
        tracing::debug!(
            "Identity mismatch {}/{} ({label})",
            self.consecutive,
            self.threshold
        );
        MismatchOutcome {
            should_block,
            consecutive: self.consecutive,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.last_label = None;
    }

    pub fn consecutive_mismatches(&self) -> u32 {
        self.consecutive
    }

    /// The label from the most recent unbroken mismatch run.
    pub fn last_mismatch_label(&self) -> Option<&str> {
        self.last_label.as_deref()
    }

    /// Whether two free-text labels name the same object, e.g. "dishwasher"
    /// and "Dish washer", or "faucet" and "faucets".
    ///
    /// Labels are compared with case, spacing and punctuation removed. A
    /// fuzzy match is only accepted when the lengths differ by at most
    /// `SAME_ITEM_MAX_EXTRA_CHARS`, so a label that merely contains the other
    /// ("washer" vs "dishwasher") is a different object.
    pub fn same_item(&self, expected: &str, candidate: &str) -> bool {
        let expected = normalize_label(expected);
        let candidate = normalize_label(candidate);
        if expected.is_empty() || candidate.is_empty() {
            return false;
        }
        if expected == candidate {
            return true;
        }

        let (pattern, choice) = if expected.len() <= candidate.len() {
            (&expected, &candidate)
        } else {
            (&candidate, &expected)
        };
        let pattern_len = pattern.chars().count();
        if pattern_len < SAME_ITEM_MIN_FUZZY_CHARS
            || choice.chars().count().saturating_sub(pattern_len) > SAME_ITEM_MAX_EXTRA_CHARS
        {
            return false;
        }
        let needed = pattern_len as i64 * SAME_ITEM_SCORE_PER_CHAR;
        self.matcher
            .fuzzy_match(choice, pattern)
            .is_some_and(|score| score >= needed)
    }
}

fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
