//! Bring-your-own-key contributions.
//!
//! A contributor supplies their own inference credentials and a spend
//! ceiling, then fills in missing page results for a book. Every call goes
//! through a [`GovernedInference`] with a governor private to the session,
//! so one contributor can never spend another's budget.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::StepCosts;
use crate::db::page_repo::{self, PageField};
use crate::db::{book_repo, Database};
use crate::error::FolioError;
use crate::governor::CostGovernor;
use crate::inference::{GovernedInference, InferenceClient, InferenceError};
use crate::ingest::source::ImageSource;
use crate::jobs::{OcrStep, PageStep, StepError, SummarizeStep, TranslateStep};
use crate::pipeline::state::{PipelineRunConfig, StepKind, StepName};
use crate::pipeline::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionReport {
    pub processed: u32,
    pub failed: u32,
    pub failed_page_ids: Vec<String>,
    pub spent: f64,
    pub ceiling: f64,
    /// The session's ceiling stopped the contribution.
    pub limit_reached: bool,
}

pub struct ContributorSession {
    db: Database,
    governor: Arc<CostGovernor>,
    client: Arc<dyn InferenceClient>,
    source: Arc<dyn ImageSource>,
    costs: StepCosts,
}

impl ContributorSession {
    pub fn new(
        db: Database,
        client: Arc<dyn InferenceClient>,
        source: Arc<dyn ImageSource>,
        costs: StepCosts,
        ceiling_usd: f64,
    ) -> Self {
        Self {
            db,
            governor: Arc::new(CostGovernor::new(ceiling_usd)),
            client,
            source,
            costs,
        }
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        &self.governor
    }

    fn governed(&self, estimated_cost: f64) -> Arc<dyn InferenceClient> {
        Arc::new(GovernedInference::new(
            self.client.clone(),
            self.governor.clone(),
            estimated_cost,
        ))
    }

    fn executor(&self, step: StepName) -> Result<Arc<dyn PageStep>, PipelineError> {
        let db = self.db.clone();
        Ok(match step {
            StepName::Ocr => Arc::new(OcrStep::new(
                db,
                self.governed(self.costs.ocr),
                self.source.clone(),
                0.0,
            )),
            StepName::Translate => {
                Arc::new(TranslateStep::new(db, self.governed(self.costs.translate), 0.0))
            }
            StepName::Summarize => {
                Arc::new(SummarizeStep::new(db, self.governed(self.costs.summarize), 0.0))
            }
            other => {
                return Err(PipelineError::Step {
                    step: other.to_string(),
                    reason: "not open to contributions".to_string(),
                })
            }
        })
    }

    /// Processes up to `max_pages` pages still missing `step`'s result,
    /// ascending, one at a time.
    ///
    /// Work finished before the ceiling is hit is kept.
    pub async fn contribute(
        &self,
        book_id: &str,
        step: StepName,
        max_pages: u32,
        config: &PipelineRunConfig,
        cancel: &CancellationToken,
    ) -> Result<ContributionReport, FolioError> {
        book_repo::require(&self.db, book_id)?;
        let StepKind::Chunked { field, .. } = step.kind() else {
            return Err(PipelineError::Step {
                step: step.to_string(),
                reason: "not open to contributions".to_string(),
            }
            .into());
        };
        let executor = self.executor(step)?;

        let pages = page_repo::missing(&self.db, book_id, field, 1, max_pages)?;
        let mut context = match pages.first() {
            Some(first) if uses_context(field) => {
                page_repo::page_before(&self.db, book_id, first.page_number)?
                    .and_then(|prev| prev.text(field).map(str::to_string))
            }
            _ => None,
        };

        let mut report = ContributionReport {
            ceiling: self.governor.ceiling(),
            ..Default::default()
        };
        for page in &pages {
            if cancel.is_cancelled() {
                break;
            }
            match executor.run(page, context.clone(), config).await {
                Ok(output) => {
                    report.processed += 1;
                    if output.context.is_some() {
                        context = output.context;
                    }
                }
                Err(StepError::Inference(InferenceError::BudgetExhausted { spent, ceiling })) => {
                    tracing::info!(book_id, spent, ceiling, "contribution stopped at session limit");
                    report.limit_reached = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(book_id, page = page.page_number, error = %e, "contributed page failed");
                    report.failed += 1;
                    report.failed_page_ids.push(page.id.clone());
                }
            }
        }

        report.spent = self.governor.spent();
        book_repo::refresh_counters(&self.db, book_id)?;
        Ok(report)
    }
}

fn uses_context(field: PageField) -> bool {
    matches!(field, PageField::Translation | PageField::Summary)
}
