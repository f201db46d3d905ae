use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("Cannot prepare database location '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// Stored pipeline state or failed-page list is not valid JSON.
    #[error("Invalid JSON in column '{column}': {reason}")]
    Json { column: &'static str, reason: String },

    #[error("Column '{column}' does not hold text")]
    NotText { column: &'static str },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}
