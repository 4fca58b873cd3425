use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    journal_entry::{CreateJournalEntry, JournalEntry},
    journal_feedback::{CreateJournalFeedback, JournalFeedback},
};
use serde::Deserialize;
use services::services::journal_gate::{Eligibility, JournalEntryWithFeedback};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

/// Body of a new journal entry; owner and plant come from the path
#[derive(Debug, Deserialize)]
pub struct CreateJournalEntryRequest {
    pub content: String,
    pub mood: Option<String>,
    pub growth_stage: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordFeedbackRequest {
    pub plant_id: String,
    pub summary: String,
    pub growth_rating: i64,
    #[serde(default)]
    pub tips: Vec<String>,
}

/// GET /api/users/{user_id}/plants/{plant_id}/journal/eligibility
pub async fn get_eligibility(
    State(state): State<AppState>,
    Path((user_id, plant_id)): Path<(String, String)>,
) -> Result<ResponseJson<ApiResponse<Eligibility>>, ApiError> {
    let eligibility = state.gate.check_eligibility(&user_id, &plant_id).await?;
    Ok(ResponseJson(ApiResponse::success(eligibility)))
}

/// GET /api/users/{user_id}/plants/{plant_id}/journal
/// Entries newest first, each with its feedback if evaluated
pub async fn list_entries(
    State(state): State<AppState>,
    Path((user_id, plant_id)): Path<(String, String)>,
) -> Result<ResponseJson<ApiResponse<Vec<JournalEntryWithFeedback>>>, ApiError> {
    let entries = state
        .gate
        .list_entries_with_feedback(&user_id, &plant_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(entries)))
}

/// POST /api/users/{user_id}/plants/{plant_id}/journal
/// Create an entry and queue its AI evaluation
pub async fn create_entry(
    State(state): State<AppState>,
    Path((user_id, plant_id)): Path<(String, String)>,
    axum::Json(payload): axum::Json<CreateJournalEntryRequest>,
) -> Result<ResponseJson<ApiResponse<JournalEntry>>, ApiError> {
    let entry = state
        .gate
        .create_entry(CreateJournalEntry {
            user_id,
            plant_id,
            content: payload.content,
            mood: payload.mood,
            growth_stage: payload.growth_stage,
            image_url: payload.image_url,
        })
        .await?;

    match &state.evaluator {
        Some(evaluator) => {
            evaluator.spawn(entry.clone());
        }
        None => tracing::debug!(entry_id = %entry.id, "Feedback evaluation disabled, skipping"),
    }

    Ok(ResponseJson(ApiResponse::success(entry)))
}

/// POST /api/journal/{entry_id}/feedback
pub async fn record_feedback(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    axum::Json(payload): axum::Json<RecordFeedbackRequest>,
) -> Result<ResponseJson<ApiResponse<JournalFeedback>>, ApiError> {
    let feedback = state
        .gate
        .record_feedback(CreateJournalFeedback {
            journal_id: entry_id,
            plant_id: payload.plant_id,
            summary: payload.summary,
            growth_rating: payload.growth_rating,
            tips: payload.tips,
        })
        .await?;
    Ok(ResponseJson(ApiResponse::success(feedback)))
}

pub fn router(_state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/users/{user_id}/plants/{plant_id}/journal",
            get(list_entries).post(create_entry),
        )
        .route(
            "/users/{user_id}/plants/{plant_id}/journal/eligibility",
            get(get_eligibility),
        )
        .route("/journal/{entry_id}/feedback", post(record_feedback))
}
