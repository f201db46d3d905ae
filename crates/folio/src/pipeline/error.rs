use thiserror::Error;

use super::state::PipelineStatus;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Rejected state transition, e.g. `pause` while idle.
    #[error("Cannot {op} pipeline while it is {from}")]
    InvalidTransition {
        op: &'static str,
        from: PipelineStatus,
    },

    #[error("Unknown book: {0}")]
    UnknownBook(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Step {step} failed: {reason}")]
    Step { step: String, reason: String },
}
