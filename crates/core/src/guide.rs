use crate::types::{GuidanceVerdict, RepairStep};
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;

/// Everything the vision model needs to judge one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceRequest {
    pub image_base64: String,
    pub mime_type: String,
    pub category: String,
    pub problem_description: String,
    /// 1-based.
    pub current_step: usize,
    pub total_steps: usize,
    pub current_step_instruction: String,
    pub step_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_item: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub category: String,
    pub diagnosis_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likely_cause: Option<String>,
}

/// A spoken question asked mid-repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub question: String,
    pub category: String,
    pub problem_description: String,
    pub current_step: usize,
    pub total_steps: usize,
    pub current_step_instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_item: Option<String>,
}

// The session controller only ever talks to the vision model through these
// two traits, so the HTTP client, the offline demo guide and the test doubles
// are interchangeable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuidanceClient: Send + Sync {
    /// Judges a single frame against the current step.
    async fn get_realtime_guidance(&self, request: &GuidanceRequest) -> Result<GuidanceVerdict>;

    /// Answers a free-form question about the current step.
    async fn answer_question(&self, request: &QuestionRequest) -> Result<String>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepairPlanProvider: Send + Sync {
    /// Called exactly once per session.
    async fn generate_repair_plan(&self, request: &PlanRequest) -> Result<Vec<RepairStep>>;
}
