//! Per-book pipeline state machine.
//!
//! `idle → running ⇄ paused`, `running → completed | failed`, and `reset`
//! from anywhere back to `idle`. All state lives in the database, so any
//! process can pick a pipeline up where another left it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::error::PipelineError;
use super::state::{
    HaltReason, PipelineRunConfig, PipelineState, PipelineStatus, StepKind, StepName, StepStatus,
};
use crate::db::book_repo::{self, BookRow};
use crate::db::{job_repo, page_repo, pipeline_repo, Database};
use crate::jobs::steps::AtomicStep;
use crate::jobs::Job;

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The pipeline is not running; nothing was done.
    Inactive(PipelineStatus),
    /// A chunked step is running; drive this job with the processor.
    Job(Job),
    /// Every step has completed.
    Completed,
    /// An atomic step failed and halted the pipeline.
    Failed { step: StepName, reason: String },
}

/// Operator view of a book's pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub book: BookRow,
    pub pipeline: PipelineState,
    pub job: Option<Job>,
}

pub struct PipelineMachine {
    db: Database,
    atomic: HashMap<StepName, Arc<dyn AtomicStep>>,
}

impl PipelineMachine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            atomic: HashMap::new(),
        }
    }

    /// Registers the executor for an atomic step.
    pub fn with_atomic_step(mut self, step: StepName, executor: Arc<dyn AtomicStep>) -> Self {
        self.atomic.insert(step, executor);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Current state; a book that never ran has an idle pipeline.
    pub fn state(&self, book_id: &str) -> Result<PipelineState, PipelineError> {
        if book_repo::get(&self.db, book_id)?.is_none() {
            return Err(PipelineError::UnknownBook(book_id.to_string()));
        }
        Ok(pipeline_repo::load(&self.db, book_id)?.unwrap_or_else(|| PipelineState::idle(book_id)))
    }

    fn save(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        state.updated_at = Utc::now();
        pipeline_repo::save(&self.db, state)?;
        Ok(())
    }

    fn require(
        state: &PipelineState,
        op: &'static str,
        allowed: &[PipelineStatus],
    ) -> Result<(), PipelineError> {
        if allowed.contains(&state.status) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                op,
                from: state.status,
            })
        }
    }

    /// Starts an idle pipeline. Returns immediately; work happens in
    /// [`advance`](Self::advance).
    pub fn start(
        &self,
        book_id: &str,
        config: PipelineRunConfig,
    ) -> Result<PipelineState, PipelineError> {
        let current = self.state(book_id)?;
        Self::require(&current, "start", &[PipelineStatus::Idle])?;

        let mut state = PipelineState::idle(book_id);
        let now = Utc::now();
        for step in state.steps.iter_mut() {
            if !config.is_enabled(step.name) {
                step.status = StepStatus::Completed;
                step.skipped = true;
                step.completed_at = Some(now);
            }
        }
        state.config = config;
        state.status = PipelineStatus::Running;
        self.save(&mut state)?;

        tracing::info!(book_id, steps = ?state.config.steps, "pipeline started");
        Ok(state)
    }

    /// Moves the pipeline forward as far as it can without chunked work.
    pub fn advance(&self, book_id: &str) -> Result<AdvanceOutcome, PipelineError> {
        loop {
            let mut state = self.state(book_id)?;
            if state.status != PipelineStatus::Running {
                return Ok(AdvanceOutcome::Inactive(state.status));
            }

            let step = match state.running_step() {
                Some(running) => running,
                None => {
                    let Some(next) = state.first_pending() else {
                        state.status = PipelineStatus::Completed;
                        self.save(&mut state)?;
                        tracing::info!(book_id, "pipeline completed");
                        return Ok(AdvanceOutcome::Completed);
                    };
                    if let Some(s) = state.step_mut(next) {
                        s.status = StepStatus::Running;
                        s.started_at = Some(Utc::now());
                    }
                    self.save(&mut state)?;
                    tracing::info!(book_id, step = %next, "step started");
                    next
                }
            };

            match step.kind() {
                StepKind::Atomic => {
                    if let Some(outcome) = self.run_atomic(&mut state, step)? {
                        return Ok(outcome);
                    }
                }
                StepKind::Chunked { field, .. } => {
                    if let Some(job) = job_repo::get_for_book(&self.db, book_id)? {
                        if job.step == step {
                            return Ok(AdvanceOutcome::Job(job));
                        }
                        tracing::warn!(book_id, job_step = %job.step, running = %step, "discarding stale job");
                        job_repo::delete_for_book(&self.db, book_id)?;
                    }

                    let total = page_repo::count_missing(&self.db, book_id, field)?;
                    if total == 0 {
                        self.finish_step(&mut state, step, StepStatus::Completed, None)?;
                        continue;
                    }

                    let job = Job::new(book_id, step, total);
                    job_repo::insert(&self.db, &job)?;
                    if let Some(s) = state.step_mut(step) {
                        s.total = total;
                    }
                    self.save(&mut state)?;
                    tracing::info!(book_id, step = %step, total, "job created");
                    return Ok(AdvanceOutcome::Job(job));
                }
            }
        }
    }

    /// Runs an atomic step. Returns `Some` when the pipeline halted.
    fn run_atomic(
        &self,
        state: &mut PipelineState,
        step: StepName,
    ) -> Result<Option<AdvanceOutcome>, PipelineError> {
        let span = tracing::info_span!("step", book_id = %state.book_id, step = %step);
        let _enter = span.enter();

        let result = match self.atomic.get(&step) {
            Some(executor) => executor
                .run(&state.book_id, &state.config)
                .map_err(|e| e.to_string()),
            None => Err(format!("no executor registered for step {}", step)),
        };

        match result {
            Ok(()) => {
                self.finish_step(state, step, StepStatus::Completed, None)?;
                Ok(None)
            }
            Err(reason) => {
                tracing::error!(error = %reason, "atomic step failed");
                self.finish_step(state, step, StepStatus::Failed, Some(reason.clone()))?;
                Ok(Some(AdvanceOutcome::Failed { step, reason }))
            }
        }
    }

    fn finish_step(
        &self,
        state: &mut PipelineState,
        step: StepName,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        if let Some(s) = state.step_mut(step) {
            s.status = status;
            s.completed_at = Some(Utc::now());
            s.error = error;
        }
        if status == StepStatus::Failed {
            state.status = PipelineStatus::Failed;
        }
        self.save(state)?;
        tracing::info!(book_id = %state.book_id, step = %step, status = ?status, "step finished");
        Ok(())
    }

    /// Persists a job's progress and mirrors it onto the step state.
    pub fn record_chunk(&self, book_id: &str, job: &Job) -> Result<(), PipelineError> {
        job_repo::update(&self.db, job)?;
        let mut state = self.state(book_id)?;
        if let Some(s) = state.step_mut(job.step) {
            s.processed = job.processed;
            s.failed = job.failed;
            s.total = job.total;
        }
        self.save(&mut state)?;
        book_repo::refresh_counters(&self.db, book_id)?;
        Ok(())
    }

    /// Closes the running step once its job reports `done`.
    ///
    /// The step fails only when every item failed.
    pub fn complete_job(&self, book_id: &str, job: &Job) -> Result<StepStatus, PipelineError> {
        let mut state = self.state(book_id)?;
        Self::require(
            &state,
            "complete job",
            &[PipelineStatus::Running, PipelineStatus::Paused],
        )?;
        if state.running_step() != Some(job.step) {
            return Err(PipelineError::Step {
                step: job.step.to_string(),
                reason: "job does not belong to the running step".to_string(),
            });
        }

        let (status, error) = if job.all_failed() {
            (
                StepStatus::Failed,
                Some(format!("all {} items failed", job.total)),
            )
        } else {
            (StepStatus::Completed, None)
        };

        if let Some(s) = state.step_mut(job.step) {
            s.processed = job.processed;
            s.failed = job.failed;
            s.total = job.total;
        }
        job_repo::delete_for_book(&self.db, book_id)?;
        self.finish_step(&mut state, job.step, status, error)?;
        book_repo::refresh_counters(&self.db, book_id)?;
        Ok(status)
    }

    pub fn pause(&self, book_id: &str) -> Result<PipelineState, PipelineError> {
        let mut state = self.state(book_id)?;
        Self::require(&state, "pause", &[PipelineStatus::Running])?;
        state.status = PipelineStatus::Paused;
        job_repo::set_paused(&self.db, book_id, true)?;
        self.save(&mut state)?;
        tracing::info!(book_id, "pipeline paused");
        Ok(state)
    }

    pub fn resume(&self, book_id: &str) -> Result<PipelineState, PipelineError> {
        let mut state = self.state(book_id)?;
        Self::require(&state, "resume", &[PipelineStatus::Paused])?;
        state.status = PipelineStatus::Running;
        state.halt = None;
        job_repo::set_paused(&self.db, book_id, false)?;
        self.save(&mut state)?;
        tracing::info!(book_id, "pipeline resumed");
        Ok(state)
    }

    /// Back to idle from any state. Page results are kept.
    pub fn reset(&self, book_id: &str) -> Result<PipelineState, PipelineError> {
        let previous = self.state(book_id)?;
        job_repo::delete_for_book(&self.db, book_id)?;
        let mut state = PipelineState::idle(book_id);
        state.config = previous.config;
        self.save(&mut state)?;
        tracing::info!(book_id, from = %previous.status, "pipeline reset");
        Ok(state)
    }

    /// Stops a running pipeline because the spend ceiling was reached.
    ///
    /// Distinct from `failed`: completed work is kept and the pipeline can
    /// be resumed once more budget is available.
    pub fn halt_for_budget(
        &self,
        book_id: &str,
        spent: f64,
        ceiling: f64,
    ) -> Result<PipelineState, PipelineError> {
        let mut state = self.state(book_id)?;
        Self::require(&state, "halt", &[PipelineStatus::Running])?;
        state.status = PipelineStatus::Paused;
        state.halt = Some(HaltReason::BudgetExhausted { spent, ceiling });
        job_repo::set_paused(&self.db, book_id, true)?;
        self.save(&mut state)?;
        tracing::warn!(book_id, spent, ceiling, "pipeline halted: spend ceiling reached");
        Ok(state)
    }

    pub fn status(&self, book_id: &str) -> Result<PipelineSnapshot, PipelineError> {
        let pipeline = self.state(book_id)?;
        let book = book_repo::require(&self.db, book_id)?;
        let job = job_repo::get_for_book(&self.db, book_id)?;
        Ok(PipelineSnapshot {
            book,
            pipeline,
            job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::page_repo::{NewPage, PageField};
    use crate::jobs::steps::StepError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStep {
        runs: AtomicUsize,
        fail: bool,
    }

    impl AtomicStep for CountingStep {
        fn run(&self, _book_id: &str, _config: &PipelineRunConfig) -> Result<(), StepError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StepError::Input("edition store offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(pages: usize, fail_edition: bool) -> (PipelineMachine, String, Arc<CountingStep>) {
        let db = Database::open_in_memory().unwrap();
        let book = BookRow::new("Chronicle");
        book_repo::insert(&db, &book).unwrap();
        let new: Vec<NewPage> = (0..pages)
            .map(|i| NewPage::plain(&format!("file:///p{}.jpg", i)))
            .collect();
        page_repo::append_pages(&db, &book.id, &new).unwrap();

        let edition = Arc::new(CountingStep {
            runs: AtomicUsize::new(0),
            fail: fail_edition,
        });
        let machine = PipelineMachine::new(db).with_atomic_step(StepName::Edition, edition.clone());
        (machine, book.id, edition)
    }

    fn only(steps: &[StepName]) -> PipelineRunConfig {
        PipelineRunConfig {
            steps: steps.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_book() {
        let (machine, _, _) = setup(0, false);
        assert!(matches!(
            machine.start("ghost", PipelineRunConfig::default()),
            Err(PipelineError::UnknownBook(_))
        ));
    }

    #[test]
    fn test_start_requires_idle() {
        let (machine, book, _) = setup(1, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        assert!(matches!(
            machine.start(&book, PipelineRunConfig::default()),
            Err(PipelineError::InvalidTransition {
                op: "start",
                from: PipelineStatus::Running
            })
        ));
    }

    #[test]
    fn test_start_does_not_run_steps() {
        let (machine, book, edition) = setup(2, false);
        let state = machine.start(&book, PipelineRunConfig::default()).unwrap();
        assert_eq!(state.status, PipelineStatus::Running);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(edition.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_advance_inactive_when_idle() {
        let (machine, book, _) = setup(1, false);
        assert_eq!(
            machine.advance(&book).unwrap(),
            AdvanceOutcome::Inactive(PipelineStatus::Idle)
        );
    }

    #[test]
    fn test_advance_creates_job_for_first_chunked_step() {
        let (machine, book, _) = setup(3, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();

        let AdvanceOutcome::Job(job) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(job.step, StepName::SplitCheck);
        assert_eq!(job.total, 3);

        let state = machine.state(&book).unwrap();
        assert_eq!(state.running_step(), Some(StepName::SplitCheck));

        // Advancing again hands back the same job instead of a new one.
        let AdvanceOutcome::Job(again) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(again.id, job.id);
    }

    #[test]
    fn test_disabled_steps_are_skipped() {
        let (machine, book, _) = setup(2, false);
        let state = machine.start(&book, only(&[StepName::Ocr])).unwrap();
        let split = state.step(StepName::SplitCheck).unwrap();
        assert_eq!(split.status, StepStatus::Completed);
        assert!(split.skipped);

        let AdvanceOutcome::Job(job) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(job.step, StepName::Ocr);
    }

    #[test]
    fn test_steps_with_no_missing_pages_complete_immediately() {
        let (machine, book, edition) = setup(0, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();

        assert_eq!(machine.advance(&book).unwrap(), AdvanceOutcome::Completed);
        let state = machine.state(&book).unwrap();
        assert_eq!(state.status, PipelineStatus::Completed);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(edition.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_atomic_step_halts_pipeline() {
        let (machine, book, _) = setup(0, true);
        machine.start(&book, only(&[StepName::Edition])).unwrap();

        let outcome = machine.advance(&book).unwrap();
        assert!(matches!(
            outcome,
            AdvanceOutcome::Failed {
                step: StepName::Edition,
                ..
            }
        ));
        let state = machine.state(&book).unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        assert!(state.step(StepName::Edition).unwrap().error.is_some());
    }

    #[test]
    fn test_complete_job_marks_step_and_moves_on() {
        let (machine, book, _) = setup(2, false);
        machine.start(&book, only(&[StepName::Ocr, StepName::Translate])).unwrap();
        let AdvanceOutcome::Job(mut job) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };

        for page in page_repo::list(machine.database(), &book).unwrap() {
            page_repo::set_text(machine.database(), &page.id, PageField::Ocr, "t", "m").unwrap();
        }
        job.processed = 2;
        job.done = true;
        assert_eq!(machine.complete_job(&book, &job).unwrap(), StepStatus::Completed);
        assert!(job_repo::get_for_book(machine.database(), &book).unwrap().is_none());

        let AdvanceOutcome::Job(next) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(next.step, StepName::Translate);
        let book_row = book_repo::get(machine.database(), &book).unwrap().unwrap();
        assert_eq!(book_row.pages_ocrd, 2);
    }

    #[test]
    fn test_complete_job_all_failed_fails_step() {
        let (machine, book, _) = setup(2, false);
        machine.start(&book, only(&[StepName::Ocr])).unwrap();
        let AdvanceOutcome::Job(mut job) = machine.advance(&book).unwrap() else {
            panic!("expected a job");
        };
        job.failed = 2;
        job.done = true;

        assert_eq!(machine.complete_job(&book, &job).unwrap(), StepStatus::Failed);
        assert_eq!(machine.state(&book).unwrap().status, PipelineStatus::Failed);
    }

    #[test]
    fn test_never_runs_step_before_earlier_ones_complete() {
        let (machine, book, _) = setup(1, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        machine.advance(&book).unwrap();

        let state = machine.state(&book).unwrap();
        let running = state.running_step().unwrap();
        for s in &state.steps {
            if s.name < running {
                assert_eq!(s.status, StepStatus::Completed);
            }
        }
        assert_eq!(
            state.steps.iter().filter(|s| s.status == StepStatus::Running).count(),
            1
        );
    }

    #[test]
    fn test_pause_resume_keeps_running_step() {
        let (machine, book, _) = setup(2, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        machine.advance(&book).unwrap();

        let paused = machine.pause(&book).unwrap();
        assert_eq!(paused.status, PipelineStatus::Paused);
        assert_eq!(paused.running_step(), Some(StepName::SplitCheck));
        assert!(job_repo::get_for_book(machine.database(), &book).unwrap().unwrap().paused);
        assert_eq!(
            machine.advance(&book).unwrap(),
            AdvanceOutcome::Inactive(PipelineStatus::Paused)
        );

        let resumed = machine.resume(&book).unwrap();
        assert_eq!(resumed.status, PipelineStatus::Running);
        assert!(!job_repo::get_for_book(machine.database(), &book).unwrap().unwrap().paused);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let (machine, book, _) = setup(1, false);
        assert!(matches!(
            machine.pause(&book),
            Err(PipelineError::InvalidTransition { op: "pause", from: PipelineStatus::Idle })
        ));
        assert!(matches!(
            machine.resume(&book),
            Err(PipelineError::InvalidTransition { op: "resume", .. })
        ));
        assert!(machine.halt_for_budget(&book, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_reset_from_any_state() {
        let (machine, book, _) = setup(2, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        machine.advance(&book).unwrap();
        machine.pause(&book).unwrap();

        let state = machine.reset(&book).unwrap();
        assert_eq!(state.status, PipelineStatus::Idle);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(job_repo::get_for_book(machine.database(), &book).unwrap().is_none());
        machine.start(&book, PipelineRunConfig::default()).unwrap();
    }

    #[test]
    fn test_halt_for_budget_pauses_with_reason() {
        let (machine, book, _) = setup(1, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        machine.advance(&book).unwrap();

        let state = machine.halt_for_budget(&book, 0.99, 1.0).unwrap();
        assert_eq!(state.status, PipelineStatus::Paused);
        assert!(matches!(state.halt, Some(HaltReason::BudgetExhausted { .. })));

        let resumed = machine.resume(&book).unwrap();
        assert!(resumed.halt.is_none());
    }

    #[test]
    fn test_status_snapshot() {
        let (machine, book, _) = setup(4, false);
        machine.start(&book, PipelineRunConfig::default()).unwrap();
        machine.advance(&book).unwrap();

        let snapshot = machine.status(&book).unwrap();
        assert_eq!(snapshot.book.id, book);
        assert_eq!(snapshot.job.unwrap().total, 4);
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Running);
    }
}
