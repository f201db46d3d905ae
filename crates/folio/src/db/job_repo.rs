//! Job repository: CRUD for the `jobs` table (at most one row per book).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::jobs::Job;
use crate::pipeline::state::StepName;

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

struct RawJob {
    id: String,
    book_id: String,
    step: String,
    total: u32,
    processed: u32,
    failed: u32,
    cursor: u32,
    done: bool,
    paused: bool,
    failed_page_ids: String,
    cost_usd: f64,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            book_id: row.get("book_id")?,
            step: row.get("step")?,
            total: row.get("total")?,
            processed: row.get("processed")?,
            failed: row.get("failed")?,
            cursor: row.get("cursor")?,
            done: row.get("done")?,
            paused: row.get("paused")?,
            failed_page_ids: row.get("failed_page_ids")?,
            cost_usd: row.get("cost_usd")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<Job, DatabaseError> {
        let step = StepName::parse(&self.step).ok_or_else(|| DatabaseError::Json {
            column: "step",
            reason: format!("unknown step '{}'", self.step),
        })?;
        let failed_page_ids =
            serde_json::from_str(&self.failed_page_ids).map_err(|e| DatabaseError::Json {
                column: "failed_page_ids",
                reason: e.to_string(),
            })?;

        Ok(Job {
            id: self.id,
            book_id: self.book_id,
            step,
            total: self.total,
            processed: self.processed,
            failed: self.failed,
            cursor: self.cursor,
            done: self.done,
            paused: self.paused,
            failed_page_ids,
            cost_usd: self.cost_usd,
            created_at: parse_time(&self.created_at),
            updated_at: parse_time(&self.updated_at),
        })
    }
}

fn failed_ids_json(job: &Job) -> Result<String, DatabaseError> {
    serde_json::to_string(&job.failed_page_ids).map_err(|e| DatabaseError::Json {
        column: "failed_page_ids",
        reason: e.to_string(),
    })
}

pub fn insert(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    let failed_ids = failed_ids_json(job)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, book_id, step, total, processed, failed, cursor, done, paused,
             failed_page_ids, cost_usd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.book_id,
                job.step.as_str(),
                job.total,
                job.processed,
                job.failed,
                job.cursor,
                job.done,
                job.paused,
                failed_ids,
                job.cost_usd,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
}

/// Persists progress. All fields except `id`, `book_id`, `step` and
/// `created_at` are overwritten.
/// Persists a job's progress columns.
///
/// `paused` is owned by [`set_paused`] and never written here, so a pause
/// issued while a chunk is in flight survives the chunk's write-back.
pub fn update(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    let failed_ids = failed_ids_json(job)?;
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET total=?2, processed=?3, failed=?4, cursor=?5, done=?6,
             failed_page_ids=?7, cost_usd=?8, updated_at=?9
             WHERE id=?1",
            params![
                job.id,
                job.total,
                job.processed,
                job.failed,
                job.cursor,
                job.done,
                failed_ids,
                job.cost_usd,
                Utc::now().to_rfc3339(),
            ],
        )?)
    })?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "job",
            id: job.id.clone(),
        });
    }
    Ok(())
}

pub fn get_for_book(db: &Database, book_id: &str) -> Result<Option<Job>, DatabaseError> {
    let raw = db.with_conn(|conn| {
        let raw = conn
            .query_row(
                "SELECT * FROM jobs WHERE book_id = ?1",
                params![book_id],
                RawJob::from_row,
            )
            .optional()?;
        Ok(raw)
    })?;
    raw.map(RawJob::into_job).transpose()
}

pub fn set_paused(db: &Database, book_id: &str, paused: bool) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET paused = ?2, updated_at = ?3 WHERE book_id = ?1",
            params![book_id, paused, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
}

pub fn delete_for_book(db: &Database, book_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute("DELETE FROM jobs WHERE book_id = ?1", params![book_id])?;
        Ok(n > 0)
    })
}
