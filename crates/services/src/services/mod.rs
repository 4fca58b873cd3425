pub mod claude_api;
pub mod clock;
pub mod feedback_evaluator;
pub mod journal_gate;
