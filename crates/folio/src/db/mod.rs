//! Book, page, pipeline and job records in SQLite.
//!
//! `books` and `pages` hold the digitized content and per-page step
//! results, `pipelines` keeps one state row per book, and `jobs` holds the
//! resumable cursor of whichever chunked step is running. Repositories are
//! free functions over a shared [`Database`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub mod book_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod page_repo;
pub mod pipeline_repo;

pub use error::DatabaseError;

/// Shared handle to the folio database. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating it and its directory on first use,
    /// and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DatabaseError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        // Readers (`folio status`) must not block a running pipeline.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::prepare(conn)?;
        log::info!("folio database ready at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        // Deleting a book cascades to its pages, pipeline and job.
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with the connection locked. Keep `f` short: every repository
    /// call in the process waits on this lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

/// Current UTC time as stored in TEXT timestamp columns.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .unwrap()
    }

    #[test]
    fn test_schema_has_folio_tables() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            tables(&db),
            vec!["_migrations", "books", "jobs", "pages", "pipelines"]
        );
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("folio.db");

        let db = Database::open(&path).unwrap();
        book_repo::insert(&db, &book_repo::BookRow::new("Antiphonary")).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert_eq!(book_repo::list(&reopened).unwrap().len(), 1);
    }

    #[test]
    fn test_deleting_book_cascades_to_pages() {
        let db = Database::open_in_memory().unwrap();
        let book = book_repo::BookRow::new("Hymnal");
        book_repo::insert(&db, &book).unwrap();
        page_repo::append_pages(&db, &book.id, &[page_repo::NewPage::plain("file:///h1.jpg")])
            .unwrap();

        let clone = db.clone();
        clone
            .with_conn(|conn| {
                conn.execute("DELETE FROM books WHERE id = ?1", [&book.id])?;
                Ok(())
            })
            .unwrap();
        assert!(page_repo::list(&db, &book.id).unwrap().is_empty());
    }
}
