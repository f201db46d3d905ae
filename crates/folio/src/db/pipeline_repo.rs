//! Pipeline repository: one row per book, step states stored as JSON.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};
use crate::pipeline::state::{PipelineState, PipelineStatus};

fn to_json<T: serde::Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Json {
        column,
        reason: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    raw: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Json {
        column,
        reason: e.to_string(),
    })
}

/// Loads a book's pipeline, if one was ever saved.
pub fn load(db: &Database, book_id: &str) -> Result<Option<PipelineState>, DatabaseError> {
    let raw = db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT status, steps, config, halt, updated_at FROM pipelines WHERE book_id = ?1",
                params![book_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    })?;

    let Some((status, steps, config, halt, updated_at)) = raw else {
        return Ok(None);
    };

    let status = PipelineStatus::parse(&status).ok_or_else(|| DatabaseError::Json {
        column: "status",
        reason: format!("unknown pipeline status '{}'", status),
    })?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Some(PipelineState {
        book_id: book_id.to_string(),
        status,
        steps: from_json("steps", &steps)?,
        config: from_json("config", &config)?,
        halt: halt.as_deref().map(|h| from_json("halt", h)).transpose()?,
        updated_at,
    }))
}

/// Inserts or replaces a book's pipeline row.
pub fn save(db: &Database, state: &PipelineState) -> Result<(), DatabaseError> {
    let steps = to_json("steps", &state.steps)?;
    let config = to_json("config", &state.config)?;
    let halt = state
        .halt
        .as_ref()
        .map(|h| to_json("halt", h))
        .transpose()?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO pipelines (book_id, status, steps, config, halt, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(book_id) DO UPDATE SET
                status = excluded.status,
                steps = excluded.steps,
                config = excluded.config,
                halt = excluded.halt,
                updated_at = excluded.updated_at",
            params![
                state.book_id,
                state.status.as_str(),
                steps,
                config,
                halt,
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
}
