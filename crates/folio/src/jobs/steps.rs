//! Per-page step executors.
//!
//! A [`PageStep`] handles one page and writes its result back itself, so a
//! success is durable the moment `run` returns. Atomic steps such as the
//! edition build implement [`AtomicStep`] instead.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::page_repo::{self, PageField, PageRow};
use crate::db::{Database, DatabaseError};
use crate::error::IngestError;
use crate::inference::{
    InferenceClient, InferenceError, InferenceInput, InferenceRequest, InferenceTask,
};
use crate::ingest::classifier::{data_uri, ClassifyInput, SpreadClassifier};
use crate::ingest::source::ImageSource;
use crate::pipeline::state::PipelineRunConfig;

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Image(#[from] IngestError),

    #[error("{0}")]
    Input(String),
}

/// What a successful page produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOutput {
    pub cost_usd: f64,
    /// Passed to the next page in sequential steps.
    pub context: Option<String>,
}

#[async_trait]
pub trait PageStep: Send + Sync {
    /// Charged to the governor before each page is dispatched.
    fn estimated_cost(&self) -> f64;

    async fn run(
        &self,
        page: &PageRow,
        context: Option<String>,
        config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError>;
}

/// A step that runs to completion inside the state machine.
pub trait AtomicStep: Send + Sync {
    fn run(&self, book_id: &str, config: &PipelineRunConfig) -> Result<(), StepError>;
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Image reference the inference service can reach: remote URLs pass
/// through, local objects are inlined as `data:` URIs.
async fn image_reference(source: &dyn ImageSource, url: &str) -> Result<String, StepError> {
    if is_remote(url) {
        return Ok(url.to_string());
    }
    let fetched = source.fetch(url).await?;
    let content_type = fetched
        .content_type
        .unwrap_or_else(|| "image/jpeg".to_string());
    Ok(data_uri(&content_type, &fetched.bytes))
}

/// Re-checks an ingested page for an uncut spread.
pub struct SplitCheckStep {
    db: Database,
    source: Arc<dyn ImageSource>,
    classifier: Arc<dyn SpreadClassifier>,
}

impl SplitCheckStep {
    pub fn new(
        db: Database,
        source: Arc<dyn ImageSource>,
        classifier: Arc<dyn SpreadClassifier>,
    ) -> Self {
        Self {
            db,
            source,
            classifier,
        }
    }
}

#[async_trait]
impl PageStep for SplitCheckStep {
    fn estimated_cost(&self) -> f64 {
        self.classifier.estimated_cost()
    }

    async fn run(
        &self,
        page: &PageRow,
        _context: Option<String>,
        _config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError> {
        let fetched = self.source.fetch(&page.image_url).await?;
        let name = crate::sanitize::url_name(&page.image_url);
        let image = image::load_from_memory(&fetched.bytes).map_err(|e| IngestError::Decode {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        let content_type = fetched
            .content_type
            .unwrap_or_else(|| "image/jpeg".to_string());

        let analysis = self
            .classifier
            .classify(ClassifyInput {
                name: &name,
                image: &image,
                bytes: &fetched.bytes,
                content_type: &content_type,
            })
            .await;

        page_repo::mark_split_checked(
            &self.db,
            &page.id,
            analysis.is_spread,
            analysis.confidence.as_str(),
        )?;
        if analysis.is_spread {
            tracing::warn!(page = page.page_number, confidence = %analysis.confidence, "page looks like an uncut spread");
        }
        Ok(ItemOutput {
            cost_usd: self.classifier.estimated_cost(),
            context: None,
        })
    }
}

pub struct OcrStep {
    db: Database,
    client: Arc<dyn InferenceClient>,
    source: Arc<dyn ImageSource>,
    estimated_cost: f64,
}

impl OcrStep {
    pub fn new(
        db: Database,
        client: Arc<dyn InferenceClient>,
        source: Arc<dyn ImageSource>,
        estimated_cost: f64,
    ) -> Self {
        Self {
            db,
            client,
            source,
            estimated_cost,
        }
    }
}

#[async_trait]
impl PageStep for OcrStep {
    fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    async fn run(
        &self,
        page: &PageRow,
        _context: Option<String>,
        _config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError> {
        let image = image_reference(self.source.as_ref(), &page.image_url).await?;
        let request = InferenceRequest::new(InferenceTask::Ocr, InferenceInput::ImageUrl(image));
        let response = self.client.infer(request).await?;
        if response.text.trim().is_empty() {
            return Err(StepError::Input(format!(
                "no text recognized on page {}",
                page.page_number
            )));
        }
        page_repo::set_text(&self.db, &page.id, PageField::Ocr, &response.text, &response.model)?;
        Ok(ItemOutput {
            cost_usd: response.cost_usd,
            context: None,
        })
    }
}

/// Shared shape of the two text-to-text steps.
struct TextStep {
    db: Database,
    client: Arc<dyn InferenceClient>,
    estimated_cost: f64,
    task: InferenceTask,
    output: PageField,
}

impl TextStep {
    async fn run(
        &self,
        page: &PageRow,
        input: &str,
        context: Option<String>,
        config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError> {
        let request = InferenceRequest::new(self.task, InferenceInput::Text(input.to_string()))
            .with_context(context)
            .with_param("target_language", &config.target_language);
        let response = self.client.infer(request).await?;
        page_repo::set_text(&self.db, &page.id, self.output, &response.text, &response.model)?;
        Ok(ItemOutput {
            cost_usd: response.cost_usd,
            context: Some(response.text),
        })
    }
}

pub struct TranslateStep(TextStep);

impl TranslateStep {
    pub fn new(db: Database, client: Arc<dyn InferenceClient>, estimated_cost: f64) -> Self {
        Self(TextStep {
            db,
            client,
            estimated_cost,
            task: InferenceTask::Translate,
            output: PageField::Translation,
        })
    }
}

#[async_trait]
impl PageStep for TranslateStep {
    fn estimated_cost(&self) -> f64 {
        self.0.estimated_cost
    }

    async fn run(
        &self,
        page: &PageRow,
        context: Option<String>,
        config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError> {
        let Some(source_text) = page.text(PageField::Ocr) else {
            return Err(StepError::Input(format!(
                "page {} has no OCR text to translate",
                page.page_number
            )));
        };
        self.0.run(page, source_text, context, config).await
    }
}

/// Summarizes the translation, or the OCR text when the book was not
/// translated.
pub struct SummarizeStep(TextStep);

impl SummarizeStep {
    pub fn new(db: Database, client: Arc<dyn InferenceClient>, estimated_cost: f64) -> Self {
        Self(TextStep {
            db,
            client,
            estimated_cost,
            task: InferenceTask::Summarize,
            output: PageField::Summary,
        })
    }
}

#[async_trait]
impl PageStep for SummarizeStep {
    fn estimated_cost(&self) -> f64 {
        self.0.estimated_cost
    }

    async fn run(
        &self,
        page: &PageRow,
        context: Option<String>,
        config: &PipelineRunConfig,
    ) -> Result<ItemOutput, StepError> {
        let Some(source_text) = page
            .text(PageField::Translation)
            .or_else(|| page.text(PageField::Ocr))
        else {
            return Err(StepError::Input(format!(
                "page {} has no text to summarize",
                page.page_number
            )));
        };
        self.0.run(page, source_text, context, config).await
    }
}
