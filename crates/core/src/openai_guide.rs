use crate::guide::{
    GuidanceClient, GuidanceRequest, PlanRequest, QuestionRequest, RepairPlanProvider,
};
use crate::types::{GuidanceVerdict, RepairStep};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

pub const GUIDANCE_PROMPT: &str = "realtime_guidance";
pub const PLAN_PROMPT: &str = "repair_plan";
pub const QUESTION_PROMPT: &str = "voice_question";

const DEFAULT_GUIDANCE_TEMPLATE: &str = r#"You are watching a live camera feed of someone repairing a {category}.
Problem: {problem}
They are on step {current_step} of {total_steps}: "{instruction}".
When the step is done the camera should show: {step_context}
Expected item: {expected_item}

Judge this single frame. Respond STRICTLY as a JSON object:
{"instruction": string, "stepComplete": bool, "wrongItem": bool,
 "detectedItemMismatch": string|null, "detectedObject": string|null,
 "shouldStop": bool, "safetyWarning": string|null,
 "highlights": [{"label": string, "x": 0-100, "y": 0-100, "width": 0-100, "height": 0-100}]}"#;

const DEFAULT_PLAN_TEMPLATE: &str = r#"Write a step-by-step repair plan for a {category}.
Diagnosis: {diagnosis}
Likely cause: {likely_cause}

Respond STRICTLY as a JSON object:
{"steps": [{"instruction": string, "lookingFor": string}]}
Each instruction is one short action. "lookingFor" describes what the camera should show once it is done."#;

const DEFAULT_QUESTION_TEMPLATE: &str = r#"Someone repairing a {category} ({problem}) is on step {current_step} of {total_steps}: "{instruction}".
They ask: "{question}"
Answer in two short spoken sentences."#;

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct PlanEnvelope {
    steps: Vec<RepairStep>,
}

/// Talks to an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiGuide {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    prompts: HashMap<String, String>,
}

impl OpenAiGuide {
    /// `prompts` overrides the built-in templates by key.
    pub fn new(api_key: SecretString, model: String, prompts: HashMap<String, String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
            prompts,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn template(&self, key: &str) -> &str {
        if let Some(custom) = self.prompts.get(key) {
            return custom;
        }
        match key {
            GUIDANCE_PROMPT => DEFAULT_GUIDANCE_TEMPLATE,
            PLAN_PROMPT => DEFAULT_PLAN_TEMPLATE,
            _ => DEFAULT_QUESTION_TEMPLATE,
        }
    }

    async fn complete(&self, content: serde_json::Value, json: bool) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": content }
            ],
            "temperature": 0.2
        });
        if json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<LlmResponse>()
            .await?;

        let answer = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
            .message
            .content;
        Ok(answer.clone())
    }
}

#[async_trait]
impl GuidanceClient for OpenAiGuide {
    async fn get_realtime_guidance(&self, request: &GuidanceRequest) -> Result<GuidanceVerdict> {
        let current_step = request.current_step.to_string();
        let total_steps = request.total_steps.to_string();
        let prompt = render(
            self.template(GUIDANCE_PROMPT),
            &[
                ("category", request.category.as_str()),
                ("problem", request.problem_description.as_str()),
                ("current_step", current_step.as_str()),
                ("total_steps", total_steps.as_str()),
                ("instruction", request.current_step_instruction.as_str()),
                ("step_context", request.step_context.as_str()),
                (
                    "expected_item",
                    request.expected_item.as_deref().unwrap_or("not confirmed yet"),
                ),
            ],
        );
        let content = serde_json::json!([
            { "type": "text", "text": prompt },
            {
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", request.mime_type, request.image_base64),
                    "detail": "low"
                }
            }
        ]);

        let answer = self.complete(content, true).await?;
        parse_verdict(&answer)
    }

    async fn answer_question(&self, request: &QuestionRequest) -> Result<String> {
        let current_step = request.current_step.to_string();
        let total_steps = request.total_steps.to_string();
        let prompt = render(
            self.template(QUESTION_PROMPT),
            &[
                ("category", request.category.as_str()),
                ("problem", request.problem_description.as_str()),
                ("current_step", current_step.as_str()),
                ("total_steps", total_steps.as_str()),
                ("instruction", request.current_step_instruction.as_str()),
                ("question", request.question.as_str()),
            ],
        );
        let answer = self
            .complete(serde_json::Value::String(prompt), false)
            .await?;
        Ok(answer.trim().to_string())
    }
}

#[async_trait]
impl RepairPlanProvider for OpenAiGuide {
    async fn generate_repair_plan(&self, request: &PlanRequest) -> Result<Vec<RepairStep>> {
        let prompt = render(
            self.template(PLAN_PROMPT),
            &[
                ("category", request.category.as_str()),
                ("diagnosis", request.diagnosis_summary.as_str()),
                (
                    "likely_cause",
                    request.likely_cause.as_deref().unwrap_or("unknown"),
                ),
            ],
        );
        let answer = self
            .complete(serde_json::Value::String(prompt), true)
            .await?;
        parse_plan(&answer)
    }
}

/// Replaces every `{key}` in the template. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

pub fn parse_verdict(answer: &str) -> Result<GuidanceVerdict> {
    serde_json::from_str(strip_code_fence(answer))
        .map_err(|e| anyhow::anyhow!("Failed to parse guidance verdict: {e}"))
}

/// Accepts either `{"steps": [...]}` or a bare array of steps.
pub fn parse_plan(answer: &str) -> Result<Vec<RepairStep>> {
    let answer = strip_code_fence(answer);
    let json_val: serde_json::Value = serde_json::from_str(answer)
        .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {e}"))?;

    let steps: Vec<RepairStep> = if json_val.is_array() {
        serde_json::from_value(json_val)?
    } else if json_val.is_object() {
        serde_json::from_value::<PlanEnvelope>(json_val)?.steps
    } else {
        return Err(anyhow::anyhow!(
            "LLM output is not an object or array: {answer}"
        ));
    };

    Ok(steps
        .into_iter()
        .filter(|s| !s.instruction.trim().is_empty())
        .collect())
}

// Some models wrap JSON in ```json fences even in JSON mode.
fn strip_code_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
