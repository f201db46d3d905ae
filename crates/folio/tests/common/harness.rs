//! Test harness for isolated test execution.
//!
//! Each `TestHarness` owns a temp object store, an in-memory database and a
//! scripted inference service, wired into a real `Folio`.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use folio::config::{ClassifierKind, Config};
use folio::db::page_repo::{self, NewPage, PageRow};
use folio::db::Database;
use folio::ingest::FsImageSource;
use folio::storage::FileObjectStore;
use folio::Folio;

use super::builders::{remote_page_url, ScriptedInference};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub inference: Arc<ScriptedInference>,
    pub app: Folio,
    config: Config,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness with config tweaks applied on top of test defaults.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = Config::with_defaults();
        config.storage.root = temp_dir.path().join("objects").to_string_lossy().into_owned();
        config.jobs.item_delay_ms = 0;
        config.jobs.batch_size = 10;
        config.jobs.sequential_chunk = 5;
        tweak(&mut config);

        let db = Database::open_in_memory().expect("Failed to open database");
        let inference = Arc::new(ScriptedInference::new());
        let app = Self::build(&config, &db, &inference);

        Self {
            temp_dir,
            db,
            inference,
            app,
            config,
        }
    }

    fn build(config: &Config, db: &Database, inference: &Arc<ScriptedInference>) -> Folio {
        Folio::with_parts(
            config.clone(),
            db.clone(),
            Arc::new(FileObjectStore::new(&config.storage.root)),
            Arc::new(FsImageSource::new(config.ingest.max_image_bytes as usize)),
            Some(inference.clone()),
        )
        .expect("Failed to build folio")
    }

    pub fn vision() -> Self {
        Self::with_config(|c| c.ingest.classifier = ClassifierKind::Vision)
    }

    /// A fresh `Folio` over the same database, as after a process restart.
    pub fn restart(&mut self) {
        self.app = Self::build(&self.config, &self.db, &self.inference);
    }

    pub fn objects_dir(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("objects")
    }

    /// Creates a book whose pages point at remote scans.
    pub fn book_with_remote_pages(&self, pages: usize) -> String {
        let book = self.app.create_book("Test codex").expect("create book");
        let new_pages: Vec<NewPage> = (1..=pages)
            .map(|n| NewPage::plain(&remote_page_url(n)))
            .collect();
        page_repo::append_pages(&self.db, &book.id, &new_pages).expect("append pages");
        self.app.resync_page_count(&book.id).expect("resync");
        book.id
    }

    pub fn pages(&self, book_id: &str) -> Vec<PageRow> {
        page_repo::list(&self.db, book_id).expect("list pages")
    }
}
