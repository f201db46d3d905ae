//! Book repository: CRUD for the `books` table.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{now, Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRow {
    pub id: String,
    pub title: String,
    pub page_count: u32,
    pub pages_ocrd: u32,
    pub pages_translated: u32,
    pub edition_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BookRow {
    pub fn new(title: &str) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            page_count: 0,
            pages_ocrd: 0,
            pages_translated: 0,
            edition_url: None,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            page_count: row.get("page_count")?,
            pages_ocrd: row.get("pages_ocrd")?,
            pages_translated: row.get("pages_translated")?,
            edition_url: row.get("edition_url")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn insert(db: &Database, book: &BookRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO books (id, title, page_count, pages_ocrd, pages_translated, edition_url,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                book.id,
                book.title,
                book.page_count,
                book.pages_ocrd,
                book.pages_translated,
                book.edition_url,
                book.created_at,
                book.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn get(db: &Database, id: &str) -> Result<Option<BookRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM books WHERE id = ?1", params![id], BookRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Like [`get`], but a missing book is an error.
pub fn require(db: &Database, id: &str) -> Result<BookRow, DatabaseError> {
    get(db, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity: "book",
        id: id.to_string(),
    })
}

pub fn list(db: &Database) -> Result<Vec<BookRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM books ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], BookRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Recomputes `page_count` and the progress counters from the pages table.
pub fn refresh_counters(db: &Database, id: &str) -> Result<BookRow, DatabaseError> {
    let changed = db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE books SET
                page_count = (SELECT COUNT(*) FROM pages WHERE book_id = ?1),
                pages_ocrd = (SELECT COUNT(*) FROM pages WHERE book_id = ?1 AND ocr_text IS NOT NULL),
                pages_translated = (SELECT COUNT(*) FROM pages
                                    WHERE book_id = ?1 AND translation_text IS NOT NULL),
                updated_at = ?2
             WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(changed)
    })?;

    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "book",
            id: id.to_string(),
        });
    }

    require(db, id)
}

pub fn set_edition_url(db: &Database, id: &str, url: Option<&str>) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE books SET edition_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, url, now()],
        )?;
        Ok(())
    })
}
