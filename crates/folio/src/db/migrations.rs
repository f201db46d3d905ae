//! Schema versions for the folio database.
//!
//! v1 books, v2 pages (numbered per book), v3 one pipeline row per book,
//! v4 the resumable job row. The applied version is recorded in
//! `_migrations`; each version is applied in its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "books",
        sql: include_str!("sql/001_create_books.sql"),
    },
    Migration {
        version: 2,
        description: "pages with per-step text and split flags",
        sql: include_str!("sql/002_create_pages.sql"),
    },
    Migration {
        version: 3,
        description: "pipeline state per book",
        sql: include_str!("sql/003_create_pipelines.sql"),
    },
    Migration {
        version: 4,
        description: "chunked job cursor per book",
        sql: include_str!("sql/004_create_jobs.sql"),
    },
];

fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Brings the schema up to the newest version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    run_until(conn, u32::MAX)
}

fn run_until(conn: &Connection, target: u32) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn)?;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        log::info!(
            "applying schema v{} ({})",
            migration.version,
            migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_upgrade_from_older_schema_keeps_books() {
        let conn = Connection::open_in_memory().unwrap();
        run_until(&conn, 2).unwrap();
        conn.execute(
            "INSERT INTO books (id, title, created_at, updated_at) VALUES ('b1', 'Psalter', 'now', 'now')",
            [],
        )
        .unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);

        run_all(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 4);
        let title: String = conn
            .query_row("SELECT title FROM books WHERE id = 'b1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "Psalter");
        conn.execute(
            "INSERT INTO jobs (id, book_id, step, created_at, updated_at)
             VALUES ('j1', 'b1', 'ocr', 'now', 'now')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = fresh();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_page_numbers_unique_per_book() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO books (id, title, created_at, updated_at) VALUES ('b1', 'T', 'now', 'now');
             INSERT INTO pages (id, book_id, page_number, image_url, created_at, updated_at)
             VALUES ('p1', 'b1', 1, 'file:///a', 'now', 'now');",
        )
        .unwrap();

        let duplicate = conn.execute(
            "INSERT INTO pages (id, book_id, page_number, image_url, created_at, updated_at)
             VALUES ('p2', 'b1', 1, 'file:///b', 'now', 'now')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_one_job_per_book() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO books (id, title, created_at, updated_at) VALUES ('b1', 'T', 'now', 'now');
             INSERT INTO jobs (id, book_id, step, created_at, updated_at)
             VALUES ('j1', 'b1', 'ocr', 'now', 'now');",
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO jobs (id, book_id, step, created_at, updated_at)
             VALUES ('j2', 'b1', 'translate', 'now', 'now')",
            [],
        );
        assert!(second.is_err());
    }
}
