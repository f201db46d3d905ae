//! Top-level handle wiring configuration, storage and the pipeline together.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::analysis::{SplitDetector, SplitTuning};
use crate::config::{ClassifierKind, Config};
use crate::contribute::ContributorSession;
use crate::db::book_repo::{self, BookRow};
use crate::db::{job_repo, page_repo, Database};
use crate::error::{ConfigError, Result};
use crate::governor::CostGovernor;
use crate::inference::{GovernedInference, HttpInferenceClient, InferenceClient};
use crate::ingest::{
    AnyImageSource, DetectorClassifier, ImageInput, ImageSource, IngestReport, IngestSettings,
    Ingestor, SpreadClassifier, VisionClassifier,
};
use crate::jobs::{
    EditionStep, JobProcessor, JobSettings, OcrStep, SplitCheckStep, SummarizeStep, TranslateStep,
};
use crate::pipeline::{
    BroadcastProgress, DriveOutcome, PipelineDriver, PipelineError, PipelineMachine,
    PipelineRunConfig, PipelineSnapshot, PipelineState, PipelineStatus, StepName,
};
use crate::secrets;
use crate::storage::{FileObjectStore, ObjectStore};

pub struct Folio {
    config: Config,
    db: Database,
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn ImageSource>,
    inference: Option<Arc<dyn InferenceClient>>,
    detector: Arc<SplitDetector>,
    machine: Arc<PipelineMachine>,
    progress: Arc<BroadcastProgress>,
}

impl Folio {
    /// Production constructor: opens the database and object store named in
    /// `config` and builds the HTTP collaborators.
    pub fn from_config(config: Config) -> Result<Self> {
        let db_path = secrets::expand_home(&config.database_path);
        let db = Database::open(Path::new(&db_path))?;
        let store = Arc::new(FileObjectStore::new(secrets::expand_home(&config.storage.root)));
        let source = Arc::new(AnyImageSource::new(
            config.ingest.max_image_bytes as usize,
            config.inference.timeout_secs,
        )?);

        let inference: Option<Arc<dyn InferenceClient>> = match &config.inference.endpoint {
            Some(endpoint) => {
                let api_key = secrets::resolve_secret_optional(
                    config.inference.api_key.as_deref(),
                    config.inference.api_key_file.as_deref(),
                    config.inference.api_key_env.as_deref(),
                )?;
                Some(Arc::new(HttpInferenceClient::new(
                    endpoint,
                    config.inference.model.clone(),
                    api_key,
                    config.inference.timeout_secs,
                )?))
            }
            None => None,
        };

        Self::with_parts(config, db, store, source, inference)
    }

    /// Builds from explicit collaborators.
    pub fn with_parts(
        config: Config,
        db: Database,
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn ImageSource>,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Result<Self> {
        if config.ingest.classifier == ClassifierKind::Vision && inference.is_none() {
            return Err(ConfigError::Validation {
                message: "the vision classifier needs an inference endpoint".to_string(),
            }
            .into());
        }

        let detector = Arc::new(SplitDetector::new(SplitTuning::from(&config.analysis)));
        let machine = Arc::new(PipelineMachine::new(db.clone()).with_atomic_step(
            StepName::Edition,
            Arc::new(EditionStep::new(db.clone(), store.clone())),
        ));

        Ok(Self {
            config,
            db,
            store,
            source,
            inference,
            detector,
            machine,
            progress: Arc::new(BroadcastProgress::new(256)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn progress(&self) -> &Arc<BroadcastProgress> {
        &self.progress
    }

    /// Spread classifier for one operation. Paid classification is charged
    /// to `governor`; once it refuses, the detector's verdict is used.
    fn classifier(&self, governor: &Arc<CostGovernor>) -> Arc<dyn SpreadClassifier> {
        let cost = self.config.governor.estimated_cost_usd.classify_spread;
        match (&self.config.ingest.classifier, &self.inference) {
            (ClassifierKind::Vision, Some(client)) => Arc::new(VisionClassifier::new(
                Arc::new(GovernedInference::new(client.clone(), governor.clone(), cost)),
                self.detector.clone(),
                cost,
            )),
            _ => Arc::new(DetectorClassifier::new(self.detector.clone())),
        }
    }

    fn new_governor(&self) -> Arc<CostGovernor> {
        Arc::new(CostGovernor::new(self.config.governor.ceiling_usd))
    }

    pub fn create_book(&self, title: &str) -> Result<BookRow> {
        let book = BookRow::new(title);
        book_repo::insert(&self.db, &book)?;
        tracing::info!(book_id = %book.id, "book created");
        Ok(book)
    }

    pub fn books(&self) -> Result<Vec<BookRow>> {
        Ok(book_repo::list(&self.db)?)
    }

    pub async fn ingest(&self, book_id: &str, inputs: Vec<ImageInput>) -> Result<IngestReport> {
        let ingestor = Ingestor::new(
            self.db.clone(),
            self.store.clone(),
            self.source.clone(),
            self.classifier(&self.new_governor()),
            IngestSettings::from(&self.config.ingest),
        );
        ingestor.ingest(book_id, inputs).await
    }

    /// Replaces every page of the book with a fresh ingest.
    ///
    /// Refused while a run is active; the pipeline is reset afterwards.
    pub async fn reimport(&self, book_id: &str, inputs: Vec<ImageInput>) -> Result<IngestReport> {
        let state = self.machine.state(book_id)?;
        if matches!(state.status, PipelineStatus::Running | PipelineStatus::Paused) {
            return Err(PipelineError::InvalidTransition {
                op: "reimport",
                from: state.status,
            }
            .into());
        }

        self.machine.reset(book_id)?;
        let removed = page_repo::delete_for_book(&self.db, book_id)?;
        book_repo::set_edition_url(&self.db, book_id, None)?;
        tracing::info!(book_id, removed, "pages removed for reimport");

        self.ingest(book_id, inputs).await
    }

    /// Recomputes the stored page count and progress counters.
    pub fn resync_page_count(&self, book_id: &str) -> Result<BookRow> {
        Ok(book_repo::refresh_counters(&self.db, book_id)?)
    }

    pub fn start(&self, book_id: &str, config: PipelineRunConfig) -> Result<PipelineState> {
        Ok(self.machine.start(book_id, config)?)
    }

    pub fn pause(&self, book_id: &str) -> Result<PipelineState> {
        Ok(self.machine.pause(book_id)?)
    }

    pub fn resume(&self, book_id: &str) -> Result<PipelineState> {
        Ok(self.machine.resume(book_id)?)
    }

    pub fn reset(&self, book_id: &str) -> Result<PipelineState> {
        Ok(self.machine.reset(book_id)?)
    }

    pub fn status(&self, book_id: &str) -> Result<PipelineSnapshot> {
        Ok(self.machine.status(book_id)?)
    }

    /// Job processor for one run, with a governor of its own.
    fn processor(&self) -> JobProcessor {
        let governor = self.new_governor();
        let costs = &self.config.governor.estimated_cost_usd;
        // The processor charges split checks itself.
        let split_check = SplitCheckStep::new(
            self.db.clone(),
            self.source.clone(),
            self.classifier(&Arc::new(CostGovernor::unlimited())),
        );

        let mut processor = JobProcessor::new(
            self.db.clone(),
            governor,
            JobSettings::from_config(&self.config.jobs),
        )
        .with_step(StepName::SplitCheck, Arc::new(split_check));

        if let Some(client) = &self.inference {
            processor = processor
                .with_step(
                    StepName::Ocr,
                    Arc::new(OcrStep::new(
                        self.db.clone(),
                        client.clone(),
                        self.source.clone(),
                        costs.ocr,
                    )),
                )
                .with_step(
                    StepName::Translate,
                    Arc::new(TranslateStep::new(self.db.clone(), client.clone(), costs.translate)),
                )
                .with_step(
                    StepName::Summarize,
                    Arc::new(SummarizeStep::new(self.db.clone(), client.clone(), costs.summarize)),
                );
        }
        processor
    }

    /// Drives the book's running pipeline until it stops.
    pub async fn run(&self, book_id: &str, cancel: &CancellationToken) -> Result<DriveOutcome> {
        if let Some(job) = job_repo::get_for_book(&self.db, book_id)? {
            tracing::info!(book_id, step = %job.step, cursor = job.cursor, "resuming job");
        }
        let driver = PipelineDriver::new(
            self.machine.clone(),
            Arc::new(self.processor()),
            self.progress.clone(),
        );
        Ok(driver.run(book_id, cancel).await?)
    }

    /// Session for a contributor paying with their own inference client.
    pub fn contributor_session(
        &self,
        client: Arc<dyn InferenceClient>,
        ceiling_usd: f64,
    ) -> ContributorSession {
        ContributorSession::new(
            self.db.clone(),
            client,
            self.source.clone(),
            self.config.governor.estimated_cost_usd.clone(),
            ceiling_usd,
        )
    }
}
