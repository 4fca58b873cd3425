pub mod journal_cadence;
pub mod journal_entry;
pub mod journal_feedback;
