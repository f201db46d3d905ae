use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::state::StepName;

/// Resumable unit of work backing one chunked pipeline step.
///
/// `cursor` is the next page number to consider. It only moves forward, past
/// every page that was attempted, so a restarted processor never repeats a
/// page within the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub book_id: String,
    pub step: StepName,
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
    pub cursor: u32,
    pub done: bool,
    pub paused: bool,
    pub failed_page_ids: Vec<String>,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(book_id: &str, step: StepName, total: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            book_id: book_id.to_string(),
            step,
            total,
            processed: 0,
            failed: 0,
            cursor: 1,
            done: total == 0,
            paused: false,
            failed_page_ids: Vec::new(),
            cost_usd: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.processed + self.failed
    }

    /// True once every counted item has an outcome.
    pub fn is_exhausted(&self) -> bool {
        self.attempted() >= self.total
    }

    /// Every item of the job failed.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed >= self.total
    }
}
