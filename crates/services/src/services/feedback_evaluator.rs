//! Generates AI feedback for journal entries and records it through the
//! journal gate. Runs out of band from entry creation.

use std::sync::Arc;

use db::models::{
    journal_entry::JournalEntry,
    journal_feedback::{CreateJournalFeedback, GrowthRating, JournalFeedback},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{
    claude_api::{ClaudeApiClient, ClaudeApiError, TextGenerator, parse_json_response},
    journal_gate::{JournalGate, JournalGateError},
};

const MAX_TIPS: usize = 5;

const SYSTEM_PROMPT: &str = "You are an experienced herbalist and horticulturist reviewing a \
     gardener's plant journal. Assess plant health and growth from the entry, be encouraging \
     but honest, and give practical, specific care advice. Never give medical advice. \
     Output valid JSON only.";

#[derive(Debug, Error)]
pub enum FeedbackEvaluatorError {
    #[error("claude api error: {0}")]
    ClaudeApi(#[from] ClaudeApiError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalGateError),
    #[error("evaluation returned an empty summary")]
    EmptySummary,
}

/// Shape of the model's JSON answer
#[derive(Debug, Clone, Deserialize)]
struct EvaluationResponse {
    summary: String,
    growth_rating: f64,
    #[serde(default)]
    tips: Vec<String>,
}

pub struct FeedbackEvaluator {
    gate: Arc<JournalGate>,
    generator: Arc<dyn TextGenerator>,
}

impl FeedbackEvaluator {
    pub fn new(gate: Arc<JournalGate>, generator: Arc<dyn TextGenerator>) -> Self {
        Self { gate, generator }
    }

    /// Build an evaluator backed by the Claude API, configured from the environment
    pub fn from_env(gate: Arc<JournalGate>) -> Result<Self, ClaudeApiError> {
        let client = ClaudeApiClient::from_env()?;
        info!(model = %client.model(), "Journal feedback evaluation enabled");
        Ok(Self::new(gate, Arc::new(client)))
    }

    /// Evaluate `entry` and record the resulting feedback
    pub async fn evaluate(
        &self,
        entry: &JournalEntry,
    ) -> Result<JournalFeedback, FeedbackEvaluatorError> {
        let prompt = build_prompt(entry);
        let reply = self
            .generator
            .generate(&prompt, Some(SYSTEM_PROMPT.to_string()))
            .await?;
        let response: EvaluationResponse = parse_json_response(&reply)?;

        let summary = response.summary.trim().to_string();
        if summary.is_empty() {
            return Err(FeedbackEvaluatorError::EmptySummary);
        }

        let feedback = CreateJournalFeedback {
            journal_id: entry.id.clone(),
            plant_id: entry.plant_id.clone(),
            summary,
            growth_rating: i64::from(
                GrowthRating::clamped(response.growth_rating.round() as i64).value(),
            ),
            tips: clean_tips(response.tips),
        };

        Ok(self.gate.record_feedback(feedback).await?)
    }

    /// Evaluate on a background task. Failures are logged, never returned to
    /// the caller that created the entry.
    pub fn spawn(self: &Arc<Self>, entry: JournalEntry) -> JoinHandle<()> {
        let evaluator = Arc::clone(self);
        tokio::spawn(async move {
            match evaluator.evaluate(&entry).await {
                Ok(feedback) => info!(
                    entry_id = %entry.id,
                    feedback_id = %feedback.id,
                    "Journal entry evaluated"
                ),
                Err(e) => error!(
                    entry_id = %entry.id,
                    error = %e,
                    "Journal entry evaluation failed"
                ),
            }
        })
    }
}

fn clean_tips(tips: Vec<String>) -> Vec<String> {
    tips.into_iter()
        .map(|tip| tip.trim().to_string())
        .filter(|tip| !tip.is_empty())
        .take(MAX_TIPS)
        .collect()
}

fn build_prompt(entry: &JournalEntry) -> String {
    let mut prompt = format!(
        r#"Review the following plant journal entry and evaluate how the plant is doing.

## Journal Entry
Written: {written}
{content}
"#,
        written = entry.created_at.format("%Y-%m-%d"),
        content = entry.content.trim(),
    );

    if let Some(mood) = entry.mood.as_deref().filter(|m| !m.trim().is_empty()) {
        prompt.push_str(&format!("Gardener's mood: {}\n", mood.trim()));
    }
    if let Some(stage) = entry.growth_stage.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("Reported growth stage: {}\n", stage.trim()));
    }
    if entry.image_url.is_some() {
        prompt.push_str("A photo was attached to this entry (not shown).\n");
    }

    prompt.push_str(
        r#"
## Output Format
Return ONLY valid JSON with this structure:
```json
{
  "summary": "One or two sentences on the plant's condition",
  "growth_rating": 7,
  "tips": ["Concrete improvement tip", "Another tip"]
}
```
growth_rating is an integer from 1 (struggling) to 10 (thriving).
Give at most 5 tips, most important first.
"#,
    );

    prompt
}
