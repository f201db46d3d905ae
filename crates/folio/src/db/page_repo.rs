//! Page repository: CRUD for the `pages` table plus the "still missing
//! field X" queries the job processor selects work with.
//!
//! The selection queries only look at `IS NULL` columns, so re-running them
//! after a crash or a completed step is always safe.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now, Database, DatabaseError};

/// A per-page result column filled in by a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageField {
    SplitCheck,
    Ocr,
    Translation,
    Summary,
}

impl PageField {
    /// Column whose NULL-ness marks the field as missing.
    fn marker_column(self) -> &'static str {
        match self {
            PageField::SplitCheck => "split_checked_at",
            PageField::Ocr => "ocr_text",
            PageField::Translation => "translation_text",
            PageField::Summary => "summary_text",
        }
    }

    fn model_column(self) -> Option<&'static str> {
        match self {
            PageField::SplitCheck => None,
            PageField::Ocr => Some("ocr_model"),
            PageField::Translation => Some("translation_model"),
            PageField::Summary => Some("summary_model"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSide {
    Left,
    Right,
}

impl PageSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PageSide::Left => "left",
            PageSide::Right => "right",
        }
    }
}

/// Text produced by an inference step, with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageText {
    pub text: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRow {
    pub id: String,
    pub book_id: String,
    pub page_number: u32,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub source_image_url: Option<String>,
    pub side: Option<String>,
    pub split_confidence: Option<String>,
    pub split_is_spread: Option<bool>,
    pub split_checked_at: Option<String>,
    pub ocr: Option<PageText>,
    pub translation: Option<PageText>,
    pub summary: Option<PageText>,
    pub created_at: String,
    pub updated_at: String,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let text = |text_col: &str, model_col: &str| -> Result<Option<PageText>, rusqlite::Error> {
            let text: Option<String> = row.get(text_col)?;
            Ok(match text {
                Some(text) => Some(PageText {
                    text,
                    model: row.get(model_col)?,
                }),
                None => None,
            })
        };

        Ok(Self {
            id: row.get("id")?,
            book_id: row.get("book_id")?,
            page_number: row.get("page_number")?,
            image_url: row.get("image_url")?,
            thumbnail_url: row.get("thumbnail_url")?,
            source_image_url: row.get("source_image_url")?,
            side: row.get("side")?,
            split_confidence: row.get("split_confidence")?,
            split_is_spread: row.get("split_is_spread")?,
            split_checked_at: row.get("split_checked_at")?,
            ocr: text("ocr_text", "ocr_model")?,
            translation: text("translation_text", "translation_model")?,
            summary: text("summary_text", "summary_model")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Stored text for a text-bearing field.
    pub fn text(&self, field: PageField) -> Option<&str> {
        let text = match field {
            PageField::SplitCheck => None,
            PageField::Ocr => self.ocr.as_ref(),
            PageField::Translation => self.translation.as_ref(),
            PageField::Summary => self.summary.as_ref(),
        };
        text.map(|t| t.text.as_str())
    }
}

/// A page about to be appended to a book.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPage {
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub source_image_url: Option<String>,
    pub side: Option<PageSide>,
    pub split_confidence: Option<String>,
}

impl NewPage {
    pub fn plain(image_url: &str) -> Self {
        Self {
            image_url: image_url.to_string(),
            ..Default::default()
        }
    }
}

/// Appends pages after the book's current last page, in one transaction.
///
/// Numbering continues from `MAX(page_number) + 1`, so a book's pages stay
/// a contiguous `1..N` range as long as pages are only ever appended.
pub fn append_pages(
    db: &Database,
    book_id: &str,
    pages: &[NewPage],
) -> Result<Vec<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let last: u32 = tx.query_row(
            "SELECT COALESCE(MAX(page_number), 0) FROM pages WHERE book_id = ?1",
            params![book_id],
            |r| r.get(0),
        )?;

        let ts = now();
        let mut ids = Vec::with_capacity(pages.len());
        for (offset, page) in pages.iter().enumerate() {
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO pages (id, book_id, page_number, image_url, thumbnail_url,
                 source_image_url, side, split_confidence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    book_id,
                    last + 1 + offset as u32,
                    page.image_url,
                    page.thumbnail_url,
                    page.source_image_url,
                    page.side.map(PageSide::as_str),
                    page.split_confidence,
                    ts,
                ],
            )?;
            ids.push(id);
        }
        tx.commit()?;

        let mut stmt = conn.prepare("SELECT * FROM pages WHERE id = ?1")?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in &ids {
            rows.push(stmt.query_row(params![id], PageRow::from_row)?);
        }
        Ok(rows)
    })
}

pub fn get(db: &Database, page_id: &str) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM pages WHERE id = ?1",
                params![page_id],
                PageRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// All pages of a book in page order.
pub fn list(db: &Database, book_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM pages WHERE book_id = ?1 ORDER BY page_number ASC")?;
        let rows = stmt
            .query_map(params![book_id], PageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count(db: &Database, book_id: &str) -> Result<u32, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE book_id = ?1",
            params![book_id],
            |r| r.get(0),
        )?;
        Ok(n)
    })
}

/// Pages still missing `field`, starting at `from_page`, ascending.
pub fn missing(
    db: &Database,
    book_id: &str,
    field: PageField,
    from_page: u32,
    limit: u32,
) -> Result<Vec<PageRow>, DatabaseError> {
    let sql = format!(
        "SELECT * FROM pages WHERE book_id = ?1 AND page_number >= ?2 AND {} IS NULL
         ORDER BY page_number ASC LIMIT ?3",
        field.marker_column()
    );
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![book_id, from_page, limit], PageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_missing(db: &Database, book_id: &str, field: PageField) -> Result<u32, DatabaseError> {
    let sql = format!(
        "SELECT COUNT(*) FROM pages WHERE book_id = ?1 AND {} IS NULL",
        field.marker_column()
    );
    db.with_conn(|conn| {
        let n = conn.query_row(&sql, params![book_id], |r| r.get(0))?;
        Ok(n)
    })
}

/// The page immediately preceding `page_number`, if any.
pub fn page_before(
    db: &Database,
    book_id: &str,
    page_number: u32,
) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM pages WHERE book_id = ?1 AND page_number < ?2
                 ORDER BY page_number DESC LIMIT 1",
                params![book_id, page_number],
                PageRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Writes a step's text result for one page.
pub fn set_text(
    db: &Database,
    page_id: &str,
    field: PageField,
    text: &str,
    model: &str,
) -> Result<(), DatabaseError> {
    let Some(model_column) = field.model_column() else {
        return Err(DatabaseError::NotText {
            column: field.marker_column(),
        });
    };
    let sql = format!(
        "UPDATE pages SET {} = ?2, {} = ?3, updated_at = ?4 WHERE id = ?1",
        field.marker_column(),
        model_column
    );
    let changed = db.with_conn(|conn| Ok(conn.execute(&sql, params![page_id, text, model, now()])?))?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "page",
            id: page_id.to_string(),
        });
    }
    Ok(())
}

/// Records the outcome of a split check on an already-ingested page.
pub fn mark_split_checked(
    db: &Database,
    page_id: &str,
    is_spread: bool,
    confidence: &str,
) -> Result<(), DatabaseError> {
    let ts = now();
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE pages SET split_is_spread = ?2, split_confidence = ?3,
             split_checked_at = ?4, updated_at = ?4 WHERE id = ?1",
            params![page_id, is_spread, confidence, ts],
        )?)
    })?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "page",
            id: page_id.to_string(),
        });
    }
    Ok(())
}

/// Deletes every page of a book. Returns the number removed.
pub fn delete_for_book(db: &Database, book_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute("DELETE FROM pages WHERE book_id = ?1", params![book_id])?)
    })
}
