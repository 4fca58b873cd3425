use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::journal_gate::{Eligibility, JournalGateError};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Journal(#[from] JournalGateError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match &self {
            ApiError::Journal(JournalGateError::CadenceViolation { next_eligible_at }) => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiResponse::<(), Eligibility>::error_with_data(
                    &message,
                    Eligibility::locked_until(*next_eligible_at),
                ),
            ),
            ApiError::Journal(JournalGateError::StoreUnavailable(e)) => {
                tracing::error!(error = %e, "Journal store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiResponse::error("Journal storage is temporarily unavailable"),
                )
            }
            ApiError::Journal(JournalGateError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, ApiResponse::error(&message))
            }
            ApiError::Journal(JournalGateError::InvalidInput(_)) => {
                (StatusCode::BAD_REQUEST, ApiResponse::error(&message))
            }
            ApiError::Journal(JournalGateError::Contended) => {
                (StatusCode::CONFLICT, ApiResponse::error(&message))
            }
        };

        (status, Json(body)).into_response()
    }
}
