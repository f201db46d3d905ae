//! Edition build: one JSON document with every page of a book.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::steps::{AtomicStep, StepError};
use crate::db::page_repo::{self, PageField};
use crate::db::{book_repo, Database};
use crate::error::IngestError;
use crate::pipeline::state::PipelineRunConfig;
use crate::storage::ObjectStore;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EditionPage<'a> {
    page_number: u32,
    image_url: &'a str,
    side: Option<&'a str>,
    ocr: Option<&'a str>,
    translation: Option<&'a str>,
    summary: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Edition<'a> {
    book_id: &'a str,
    title: &'a str,
    language: &'a str,
    generated_at: String,
    pages: Vec<EditionPage<'a>>,
}

pub struct EditionStep {
    db: Database,
    store: Arc<dyn ObjectStore>,
}

impl EditionStep {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, store }
    }
}

impl AtomicStep for EditionStep {
    fn run(&self, book_id: &str, config: &PipelineRunConfig) -> Result<(), StepError> {
        let book = book_repo::require(&self.db, book_id)?;
        let pages = page_repo::list(&self.db, book_id)?;
        if pages.is_empty() {
            return Err(StepError::Input("book has no pages".to_string()));
        }

        let edition = Edition {
            book_id,
            title: &book.title,
            language: &config.target_language,
            generated_at: Utc::now().to_rfc3339(),
            pages: pages
                .iter()
                .map(|page| EditionPage {
                    page_number: page.page_number,
                    image_url: &page.image_url,
                    side: page.side.as_deref(),
                    ocr: page.text(PageField::Ocr),
                    translation: page.text(PageField::Translation),
                    summary: page.text(PageField::Summary),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&edition)
            .map_err(|e| StepError::Input(format!("failed to serialize edition: {}", e)))?;

        let url = self
            .store
            .put(&format!("editions/{}.json", book_id), &json, "application/json")
            .map_err(IngestError::from)?;
        book_repo::set_edition_url(&self.db, book_id, Some(&url))?;

        tracing::info!(book_id, pages = pages.len(), "edition written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::book_repo::BookRow;
    use crate::db::page_repo::NewPage;
    use crate::storage::FileObjectStore;
    use tempfile::TempDir;

    #[test]
    fn test_edition_written_and_linked() {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let book = BookRow::new("Herbal");
        book_repo::insert(&db, &book).unwrap();
        let pages = page_repo::append_pages(
            &db,
            &book.id,
            &[NewPage::plain("file:///a.jpg"), NewPage::plain("file:///b.jpg")],
        )
        .unwrap();
        page_repo::set_text(&db, &pages[0].id, PageField::Ocr, "Salvia", "m").unwrap();

        let step = EditionStep::new(db.clone(), Arc::new(FileObjectStore::new(temp.path())));
        step.run(&book.id, &PipelineRunConfig::default()).unwrap();

        let stored = book_repo::require(&db, &book.id).unwrap();
        let url = stored.edition_url.unwrap();
        let path = url.strip_prefix("file://").unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(json["title"], "Herbal");
        assert_eq!(json["language"], "English");
        assert_eq!(json["pages"].as_array().unwrap().len(), 2);
        assert_eq!(json["pages"][0]["ocr"], "Salvia");
        assert!(json["pages"][1]["ocr"].is_null());
    }

    #[test]
    fn test_edition_of_empty_book_fails() {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let book = BookRow::new("Blank");
        book_repo::insert(&db, &book).unwrap();

        let step = EditionStep::new(db, Arc::new(FileObjectStore::new(temp.path())));
        assert!(matches!(
            step.run(&book.id, &PipelineRunConfig::default()),
            Err(StepError::Input(_))
        ));
    }
}
