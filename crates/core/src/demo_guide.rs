//! An offline guide that needs no network or API key.
//!
//! Plans are a fixed three-step script. Every frame reports the session's own
//! category as the detected object, and a step reads as complete from the
//! second frame it is shown onwards, so two more frames confirm it.

use crate::guide::{
    GuidanceClient, GuidanceRequest, PlanRequest, QuestionRequest, RepairPlanProvider,
};
use crate::types::{GuidanceVerdict, Highlight, RepairStep};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct DemoGuide {
    frames_per_step: Mutex<HashMap<usize, u32>>,
}

impl DemoGuide {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepairPlanProvider for DemoGuide {
    async fn generate_repair_plan(&self, request: &PlanRequest) -> Result<Vec<RepairStep>> {
        let item = request.category.trim();
        Ok(vec![
            RepairStep::new(
                format!("Switch off and unplug the {item}, or shut off its supply"),
                format!("the {item} disconnected"),
            ),
            RepairStep::new(
                format!("Open the {item} and find the damaged part"),
                "the damaged part in view",
            ),
            RepairStep::new(
                "Replace or tighten the damaged part, then reassemble",
                format!("the {item} reassembled"),
            ),
        ])
    }
}

#[async_trait]
impl GuidanceClient for DemoGuide {
    async fn get_realtime_guidance(&self, request: &GuidanceRequest) -> Result<GuidanceVerdict> {
        let seen = {
            let mut frames = self.frames_per_step.lock().await;
            let count = frames.entry(request.current_step).or_insert(0);
            *count += 1;
            *count
        };

        let step_complete = seen >= 2;
        let instruction = if step_complete {
            format!("Looks good. {} is done.", request.step_context)
        } else {
            request.current_step_instruction.clone()
        };

        Ok(GuidanceVerdict {
            instruction,
            step_complete,
            detected_object: Some(request.category.clone()),
            highlights: vec![Highlight {
                label: request.category.clone(),
                x: 30.0,
                y: 30.0,
                width: 40.0,
                height: 40.0,
            }],
            ..Default::default()
        })
    }

    async fn answer_question(&self, request: &QuestionRequest) -> Result<String> {
        Ok(format!(
            "You're on step {} of {}: {}. Take your time and keep the {} in view.",
            request.current_step,
            request.total_steps,
            request.current_step_instruction,
            request.category
        ))
    }
}
