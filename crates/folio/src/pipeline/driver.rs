//! Drives a running pipeline to a stopping point.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::PipelineError;
use super::machine::{AdvanceOutcome, PipelineMachine};
use super::progress::{ProgressEvent, ProgressReporter};
use super::state::{PipelineStatus, StepName, StepStatus};
use crate::db::job_repo;
use crate::jobs::{Job, JobProcessor};

/// Why [`PipelineDriver::run`] returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriveOutcome {
    Completed,
    Failed { step: StepName, reason: String },
    /// Paused by someone else while the driver was working.
    Paused,
    /// The cancellation token fired; the pipeline was paused.
    Cancelled,
    BudgetExhausted { spent: f64, ceiling: f64 },
    /// The pipeline was not running to begin with.
    Inactive(PipelineStatus),
}

pub struct PipelineDriver {
    machine: Arc<PipelineMachine>,
    processor: Arc<JobProcessor>,
    progress: Arc<dyn ProgressReporter>,
}

impl PipelineDriver {
    pub fn new(
        machine: Arc<PipelineMachine>,
        processor: Arc<JobProcessor>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            machine,
            processor,
            progress,
        }
    }

    /// Alternates `advance` and chunk processing until the pipeline stops.
    ///
    /// The job is persisted after every chunk, so a crash loses at most the
    /// chunk in flight and the next run resumes at the stored cursor.
    pub async fn run(
        &self,
        book_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome, PipelineError> {
        loop {
            if cancel.is_cancelled() {
                self.pause_quietly(book_id)?;
                return Ok(self.stopped(book_id, DriveOutcome::Cancelled));
            }

            match self.machine.advance(book_id)? {
                AdvanceOutcome::Inactive(PipelineStatus::Paused) => {
                    return Ok(DriveOutcome::Paused);
                }
                AdvanceOutcome::Inactive(status) => return Ok(DriveOutcome::Inactive(status)),
                AdvanceOutcome::Completed => {
                    return Ok(self.stopped(book_id, DriveOutcome::Completed));
                }
                AdvanceOutcome::Failed { step, reason } => {
                    self.progress.report(ProgressEvent::StepFinished {
                        book_id: book_id.to_string(),
                        step,
                        status: StepStatus::Failed,
                    });
                    return Ok(self.stopped(book_id, DriveOutcome::Failed { step, reason }));
                }
                AdvanceOutcome::Job(job) => {
                    if let Some(outcome) = self.drive_job(book_id, job, cancel).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Processes chunks until the job is done (`None`) or the run stops.
    async fn drive_job(
        &self,
        book_id: &str,
        mut job: Job,
        cancel: &CancellationToken,
    ) -> Result<Option<DriveOutcome>, PipelineError> {
        let config = self.machine.state(book_id)?.config;
        self.progress.report(ProgressEvent::StepStarted {
            book_id: book_id.to_string(),
            step: job.step,
            total: job.total,
        });

        loop {
            let outcome = self.processor.process_chunk(&mut job, cancel, &config).await?;
            if let Some(status) = self.withdrawn(book_id, &job)? {
                tracing::info!(book_id, step = %job.step, %status, "job withdrawn during chunk");
                return Ok(Some(self.stopped(book_id, DriveOutcome::Inactive(status))));
            }
            self.machine.record_chunk(book_id, &job)?;
            self.progress.report(ProgressEvent::Chunk {
                book_id: book_id.to_string(),
                step: job.step,
                processed: job.processed,
                failed: job.failed,
                total: job.total,
            });

            if outcome.budget_exhausted {
                let governor = self.processor.governor();
                let (spent, ceiling) = (governor.spent(), governor.ceiling());
                self.machine.halt_for_budget(book_id, spent, ceiling)?;
                self.progress.report(ProgressEvent::BudgetExhausted {
                    book_id: book_id.to_string(),
                    spent,
                    ceiling,
                });
                return Ok(Some(DriveOutcome::BudgetExhausted { spent, ceiling }));
            }
            if outcome.paused {
                self.pause_quietly(book_id)?;
                return Ok(Some(self.stopped(book_id, DriveOutcome::Cancelled)));
            }
            if outcome.done {
                let status = self.machine.complete_job(book_id, &job)?;
                self.progress.report(ProgressEvent::StepFinished {
                    book_id: book_id.to_string(),
                    step: job.step,
                    status,
                });
                if status == StepStatus::Failed {
                    let reason = format!("all {} items failed", job.total);
                    return Ok(Some(self.stopped(
                        book_id,
                        DriveOutcome::Failed {
                            step: job.step,
                            reason,
                        },
                    )));
                }
                return Ok(None);
            }

            match self.machine.state(book_id)?.status {
                PipelineStatus::Running => {}
                PipelineStatus::Paused => return Ok(Some(DriveOutcome::Paused)),
                other => return Ok(Some(DriveOutcome::Inactive(other))),
            }
        }
    }

    /// Status to stop with when the job was taken away mid-chunk, e.g. by a
    /// `reset` from another caller. Page results already written are kept.
    fn withdrawn(&self, book_id: &str, job: &Job) -> Result<Option<PipelineStatus>, PipelineError> {
        let status = self.machine.state(book_id)?.status;
        if !matches!(status, PipelineStatus::Running | PipelineStatus::Paused) {
            return Ok(Some(status));
        }
        let live = job_repo::get_for_book(self.machine.database(), book_id)?;
        if live.is_some_and(|stored| stored.id == job.id) {
            Ok(None)
        } else {
            Ok(Some(status))
        }
    }

    /// Pauses unless someone already moved the pipeline out of `running`.
    fn pause_quietly(&self, book_id: &str) -> Result<(), PipelineError> {
        match self.machine.pause(book_id) {
            Ok(_) | Err(PipelineError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stopped(&self, book_id: &str, outcome: DriveOutcome) -> DriveOutcome {
        if let Ok(state) = self.machine.state(book_id) {
            self.progress.report(ProgressEvent::Stopped {
                book_id: book_id.to_string(),
                status: state.status,
            });
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::book_repo::{self, BookRow};
    use crate::db::page_repo::{self, NewPage, PageField, PageRow};
    use crate::db::Database;
    use crate::governor::CostGovernor;
    use crate::jobs::{AtomicStep, ItemOutput, JobSettings, PageStep, StepError};
    use crate::pipeline::progress::BroadcastProgress;
    use crate::pipeline::state::PipelineRunConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Ocr {
        db: Database,
        fail_all: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageStep for Ocr {
        fn estimated_cost(&self) -> f64 {
            0.01
        }

        async fn run(
            &self,
            page: &PageRow,
            _context: Option<String>,
            _config: &PipelineRunConfig,
        ) -> Result<ItemOutput, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Err(StepError::Input("blank scan".to_string()));
            }
            page_repo::set_text(&self.db, &page.id, PageField::Ocr, "text", "fake")?;
            Ok(ItemOutput {
                cost_usd: 0.01,
                context: None,
            })
        }
    }

    struct Edition;

    impl AtomicStep for Edition {
        fn run(&self, _book_id: &str, _config: &PipelineRunConfig) -> Result<(), StepError> {
            Ok(())
        }
    }

    struct Harness {
        driver: PipelineDriver,
        machine: Arc<PipelineMachine>,
        ocr: Arc<Ocr>,
        book: String,
    }

    fn harness(pages: usize, ceiling: f64, fail_all: bool) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let book = BookRow::new("Atlas");
        book_repo::insert(&db, &book).unwrap();
        let new_pages: Vec<NewPage> = (0..pages)
            .map(|i| NewPage::plain(&format!("file:///p{}.jpg", i)))
            .collect();
        page_repo::append_pages(&db, &book.id, &new_pages).unwrap();

        let ocr = Arc::new(Ocr {
            db: db.clone(),
            fail_all,
            calls: AtomicUsize::new(0),
        });
        let machine = Arc::new(
            PipelineMachine::new(db.clone()).with_atomic_step(StepName::Edition, Arc::new(Edition)),
        );
        let processor = Arc::new(
            JobProcessor::new(
                db,
                Arc::new(CostGovernor::new(ceiling)),
                JobSettings {
                    batch_size: 4,
                    sequential_chunk: 2,
                    item_delay: Duration::ZERO,
                },
            )
            .with_step(StepName::Ocr, ocr.clone()),
        );
        Harness {
            driver: PipelineDriver::new(machine.clone(), processor, Arc::new(BroadcastProgress::new(64))),
            machine,
            ocr,
            book: book.id,
        }
    }

    /// Runs an operator action from inside page 1, as a second caller would
    /// while the chunk is in flight.
    struct Interrupting {
        db: Database,
        machine: Arc<PipelineMachine>,
        book: String,
        action: fn(&PipelineMachine, &str),
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageStep for Interrupting {
        fn estimated_cost(&self) -> f64 {
            0.0
        }

        async fn run(
            &self,
            page: &PageRow,
            _context: Option<String>,
            _config: &PipelineRunConfig,
        ) -> Result<ItemOutput, StepError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                (self.action)(&self.machine, &self.book);
            }
            page_repo::set_text(&self.db, &page.id, PageField::Ocr, "text", "fake")?;
            Ok(ItemOutput::default())
        }
    }

    fn interrupted(
        pages: usize,
        action: fn(&PipelineMachine, &str),
    ) -> (PipelineDriver, Arc<PipelineMachine>, Arc<Interrupting>, Database, String) {
        let db = Database::open_in_memory().unwrap();
        let book = BookRow::new("Gradual");
        book_repo::insert(&db, &book).unwrap();
        let new_pages: Vec<NewPage> = (0..pages)
            .map(|i| NewPage::plain(&format!("file:///g{}.jpg", i)))
            .collect();
        page_repo::append_pages(&db, &book.id, &new_pages).unwrap();

        let machine = Arc::new(PipelineMachine::new(db.clone()));
        let step = Arc::new(Interrupting {
            db: db.clone(),
            machine: machine.clone(),
            book: book.id.clone(),
            action,
            calls: AtomicUsize::new(0),
        });
        let processor = Arc::new(
            JobProcessor::new(
                db.clone(),
                Arc::new(CostGovernor::unlimited()),
                JobSettings {
                    batch_size: 2,
                    sequential_chunk: 2,
                    item_delay: Duration::ZERO,
                },
            )
            .with_step(StepName::Ocr, step.clone()),
        );
        let driver = PipelineDriver::new(machine.clone(), processor, Arc::new(BroadcastProgress::new(64)));
        (driver, machine, step, db, book.id)
    }

    fn ocr_only() -> PipelineRunConfig {
        PipelineRunConfig {
            steps: vec![StepName::Ocr],
            ..Default::default()
        }
    }

    fn ocr_and_edition() -> PipelineRunConfig {
        PipelineRunConfig {
            steps: vec![StepName::Ocr, StepName::Edition],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let h = harness(10, 10.0, false);
        h.machine.start(&h.book, ocr_and_edition()).unwrap();

        let outcome = h.driver.run(&h.book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 10);

        let snapshot = h.machine.status(&h.book).unwrap();
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Completed);
        assert_eq!(snapshot.book.pages_ocrd, 10);
        assert!(snapshot.job.is_none());
    }

    #[tokio::test]
    async fn test_not_running_is_inactive() {
        let h = harness(2, 10.0, false);
        let outcome = h.driver.run(&h.book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Inactive(PipelineStatus::Idle));
    }

    #[tokio::test]
    async fn test_cancel_pauses_pipeline() {
        let h = harness(3, 10.0, false);
        h.machine.start(&h.book, ocr_and_edition()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.driver.run(&h.book, &cancel).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Cancelled);
        assert_eq!(h.machine.state(&h.book).unwrap().status, PipelineStatus::Paused);
        assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_halts() {
        let h = harness(10, 0.05, false);
        h.machine.start(&h.book, ocr_and_edition()).unwrap();

        let outcome = h.driver.run(&h.book, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DriveOutcome::BudgetExhausted { .. }));

        let snapshot = h.machine.status(&h.book).unwrap();
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Paused);
        assert!(snapshot.pipeline.halt.is_some());
        let job = snapshot.job.unwrap();
        assert!(job.paused);
        assert_eq!(job.processed, 5);
        assert_eq!(job.cursor, 6);
    }

    #[tokio::test]
    async fn test_all_items_failing_fails_pipeline() {
        let h = harness(3, 10.0, true);
        h.machine.start(&h.book, ocr_and_edition()).unwrap();

        let outcome = h.driver.run(&h.book, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            DriveOutcome::Failed {
                step: StepName::Ocr,
                ..
            }
        ));
        assert_eq!(h.machine.state(&h.book).unwrap().status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_pause_during_chunk_sticks() {
        let (driver, machine, step, _db, book) = interrupted(4, |m, b| {
            m.pause(b).unwrap();
        });
        machine.start(&book, ocr_only()).unwrap();

        let outcome = driver.run(&book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Paused);

        let snapshot = machine.status(&book).unwrap();
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Paused);
        let job = snapshot.job.unwrap();
        assert!(job.paused);
        assert_eq!((job.processed, job.cursor), (2, 3));

        machine.resume(&book).unwrap();
        let outcome = driver.run(&book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);
        assert_eq!(step.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_reset_during_chunk_stops_cleanly() {
        let (driver, machine, _step, db, book) = interrupted(4, |m, b| {
            m.reset(b).unwrap();
        });
        machine.start(&book, ocr_only()).unwrap();

        let outcome = driver.run(&book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Inactive(PipelineStatus::Idle));

        let snapshot = machine.status(&book).unwrap();
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Idle);
        assert!(snapshot.job.is_none());
        // Pages finished before the reset keep their results.
        assert_eq!(page_repo::count_missing(&db, &book, PageField::Ocr).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restart_during_chunk_leaves_new_job_alone() {
        let (driver, machine, _step, _db, book) = interrupted(4, |m, b| {
            m.reset(b).unwrap();
            m.start(
                b,
                PipelineRunConfig {
                    steps: vec![StepName::Ocr],
                    ..Default::default()
                },
            )
            .unwrap();
        });
        machine.start(&book, ocr_only()).unwrap();

        let outcome = driver.run(&book, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DriveOutcome::Inactive(PipelineStatus::Running));

        // The restarted pipeline has no job yet; the stale one was not written back.
        assert!(machine.status(&book).unwrap().job.is_none());
    }
}
