use std::sync::Arc;

use services::services::{feedback_evaluator::FeedbackEvaluator, journal_gate::JournalGate};

pub mod config;
pub mod error;
pub mod routes;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<JournalGate>,
    /// `None` when no generative-text backend is configured
    pub evaluator: Option<Arc<FeedbackEvaluator>>,
}

impl AppState {
    pub fn new(gate: Arc<JournalGate>, evaluator: Option<Arc<FeedbackEvaluator>>) -> Self {
        Self { gate, evaluator }
    }
}
