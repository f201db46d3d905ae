//! Chunked execution of a step's job.
//!
//! One call to [`JobProcessor::process_chunk`] does a bounded amount of
//! work and updates the job in memory; the caller persists it. Page
//! failures are recorded on the job and never abort the chunk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::steps::{ItemOutput, PageStep, StepError};
use super::Job;
use crate::config::JobsConfig;
use crate::db::page_repo::{self, PageField, PageRow};
use crate::db::Database;
use crate::governor::CostGovernor;
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::{ExecutionMode, PipelineRunConfig, StepKind, StepName};

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Pages dispatched concurrently per parallel chunk.
    pub batch_size: usize,
    /// Pages handled per sequential chunk.
    pub sequential_chunk: usize,
    /// Pause between sequential items.
    pub item_delay: Duration,
}

impl JobSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            sequential_chunk: config.sequential_chunk.max(1),
            item_delay: Duration::from_millis(config.item_delay_ms),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    pub processed_delta: u32,
    pub failed_delta: u32,
    /// No work left for this job.
    pub done: bool,
    /// Stopped early because the cancellation token fired.
    pub paused: bool,
    /// Stopped early because the governor refused a charge.
    pub budget_exhausted: bool,
    pub completed_ids: Vec<String>,
    pub failed_ids: Vec<String>,
}

impl ChunkOutcome {
    fn record(&mut self, job: &mut Job, page: &PageRow, result: Result<ItemOutput, StepError>) {
        job.cursor = job.cursor.max(page.page_number + 1);
        match result {
            Ok(output) => {
                job.processed += 1;
                job.cost_usd += output.cost_usd;
                self.processed_delta += 1;
                self.completed_ids.push(page.id.clone());
            }
            Err(e) => {
                tracing::warn!(page = page.page_number, error = %e, "page failed");
                job.failed += 1;
                job.failed_page_ids.push(page.id.clone());
                self.failed_delta += 1;
                self.failed_ids.push(page.id.clone());
            }
        }
    }
}

pub struct JobProcessor {
    db: Database,
    steps: HashMap<StepName, Arc<dyn PageStep>>,
    governor: Arc<CostGovernor>,
    settings: JobSettings,
}

impl JobProcessor {
    pub fn new(db: Database, governor: Arc<CostGovernor>, settings: JobSettings) -> Self {
        Self {
            db,
            steps: HashMap::new(),
            governor,
            settings,
        }
    }

    pub fn with_step(mut self, name: StepName, step: Arc<dyn PageStep>) -> Self {
        self.steps.insert(name, step);
        self
    }

    pub fn governor(&self) -> &Arc<CostGovernor> {
        &self.governor
    }

    /// Runs one chunk of `job` and advances its counters and cursor.
    pub async fn process_chunk(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        config: &PipelineRunConfig,
    ) -> Result<ChunkOutcome, PipelineError> {
        let StepKind::Chunked { mode, field } = job.step.kind() else {
            return Err(PipelineError::Step {
                step: job.step.to_string(),
                reason: "step is not chunked".to_string(),
            });
        };
        let step = self
            .steps
            .get(&job.step)
            .cloned()
            .ok_or_else(|| PipelineError::Step {
                step: job.step.to_string(),
                reason: "no executor registered".to_string(),
            })?;

        let span = tracing::info_span!(
            "chunk",
            book_id = %job.book_id,
            step = %job.step,
            cursor = job.cursor
        );
        let mut outcome = match mode {
            ExecutionMode::ParallelBatch => {
                self.run_batch(job, step.as_ref(), field, cancel, config)
                    .instrument(span)
                    .await?
            }
            ExecutionMode::SequentialWithContext => {
                self.run_sequential(job, step.as_ref(), field, cancel, config)
                    .instrument(span)
                    .await?
            }
        };

        if !outcome.paused && !outcome.budget_exhausted {
            outcome.done = job.is_exhausted()
                || page_repo::missing(&self.db, &job.book_id, field, job.cursor, 1)?.is_empty();
        }
        job.done = outcome.done;
        job.updated_at = chrono::Utc::now();

        tracing::debug!(
            book_id = %job.book_id,
            step = %job.step,
            processed = outcome.processed_delta,
            failed = outcome.failed_delta,
            cursor = job.cursor,
            done = outcome.done,
            "chunk finished"
        );
        Ok(outcome)
    }

    /// Charges the governor for one item. Free items are never refused.
    fn admit(&self, cost: f64) -> bool {
        cost <= 0.0 || self.governor.charge(cost).allowed
    }

    /// Replaces an item's charged estimate with the cost it reported.
    /// Failed items keep their estimate.
    fn settle(&self, estimated: f64, result: &Result<ItemOutput, StepError>) {
        if let Ok(output) = result {
            self.governor.settle(estimated.max(0.0), output.cost_usd);
        }
    }

    async fn run_batch(
        &self,
        job: &mut Job,
        step: &dyn PageStep,
        field: PageField,
        cancel: &CancellationToken,
        config: &PipelineRunConfig,
    ) -> Result<ChunkOutcome, PipelineError> {
        let mut outcome = ChunkOutcome::default();
        if cancel.is_cancelled() {
            outcome.paused = true;
            return Ok(outcome);
        }

        let pages = page_repo::missing(
            &self.db,
            &job.book_id,
            field,
            job.cursor,
            self.settings.batch_size as u32,
        )?;

        let cost = step.estimated_cost();
        let mut admitted = Vec::with_capacity(pages.len());
        for page in pages {
            if !self.admit(cost) {
                outcome.budget_exhausted = true;
                break;
            }
            admitted.push(page);
        }

        let results = join_all(admitted.iter().map(|page| step.run(page, None, config))).await;
        for (page, result) in admitted.iter().zip(results) {
            self.settle(cost, &result);
            outcome.record(job, page, result);
        }
        Ok(outcome)
    }

    async fn run_sequential(
        &self,
        job: &mut Job,
        step: &dyn PageStep,
        field: PageField,
        cancel: &CancellationToken,
        config: &PipelineRunConfig,
    ) -> Result<ChunkOutcome, PipelineError> {
        let mut outcome = ChunkOutcome::default();
        let pages = page_repo::missing(
            &self.db,
            &job.book_id,
            field,
            job.cursor,
            self.settings.sequential_chunk as u32,
        )?;

        let mut context = match pages.first() {
            Some(first) => page_repo::page_before(&self.db, &job.book_id, first.page_number)?
                .and_then(|prev| prev.text(field).map(str::to_string)),
            None => None,
        };

        let cost = step.estimated_cost();
        for page in &pages {
            if cancel.is_cancelled() {
                outcome.paused = true;
                break;
            }
            if job.attempted() > 0 && !self.settings.item_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome.paused = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.settings.item_delay) => {}
                }
            }
            if !self.admit(cost) {
                outcome.budget_exhausted = true;
                break;
            }

            let result = step.run(page, context.clone(), config).await;
            self.settle(cost, &result);
            if let Ok(output) = &result {
                if output.context.is_some() {
                    context = output.context.clone();
                }
            }
            outcome.record(job, page, result);
        }
        Ok(outcome)
    }
}
