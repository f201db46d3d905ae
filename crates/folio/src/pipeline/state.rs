//! Persistent per-book pipeline state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::page_repo::PageField;

/// Pipeline steps in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    SplitCheck,
    Ocr,
    Translate,
    Summarize,
    Edition,
}

/// How a chunked step dispatches its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Page-independent work, dispatched concurrently per batch.
    ParallelBatch,
    /// One page at a time, ascending, with the previous output as context.
    SequentialWithContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Backed by a [`crate::jobs::Job`] over pages missing `field`.
    Chunked { mode: ExecutionMode, field: PageField },
    /// Runs to completion inside `advance`.
    Atomic,
}

impl StepName {
    pub const ORDER: [StepName; 5] = [
        StepName::SplitCheck,
        StepName::Ocr,
        StepName::Translate,
        StepName::Summarize,
        StepName::Edition,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::SplitCheck => "split_check",
            StepName::Ocr => "ocr",
            StepName::Translate => "translate",
            StepName::Summarize => "summarize",
            StepName::Edition => "edition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|step| step.as_str() == s)
    }

    pub fn kind(self) -> StepKind {
        use ExecutionMode::*;
        match self {
            StepName::SplitCheck => StepKind::Chunked {
                mode: ParallelBatch,
                field: PageField::SplitCheck,
            },
            StepName::Ocr => StepKind::Chunked {
                mode: ParallelBatch,
                field: PageField::Ocr,
            },
            StepName::Translate => StepKind::Chunked {
                mode: SequentialWithContext,
                field: PageField::Translation,
            },
            StepName::Summarize => StepKind::Chunked {
                mode: SequentialWithContext,
                field: PageField::Summary,
            },
            StepName::Edition => StepKind::Atomic,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(PipelineStatus::Idle),
            "running" => Some(PipelineStatus::Running),
            "paused" => Some(PipelineStatus::Paused),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default)]
    pub processed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Disabled for this run; completed without doing any work.
    #[serde(default)]
    pub skipped: bool,
}

impl StepState {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            processed: 0,
            failed: 0,
            total: 0,
            started_at: None,
            completed_at: None,
            error: None,
            skipped: false,
        }
    }
}

/// Why a pipeline stopped without failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    BudgetExhausted { spent: f64, ceiling: f64 },
}

/// Per-run options chosen at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunConfig {
    /// Enabled steps. Steps not listed are recorded as skipped.
    pub steps: Vec<StepName>,
    pub target_language: String,
}

impl Default for PipelineRunConfig {
    fn default() -> Self {
        Self {
            steps: StepName::ORDER.to_vec(),
            target_language: "English".to_string(),
        }
    }
}

impl PipelineRunConfig {
    pub fn is_enabled(&self, step: StepName) -> bool {
        self.steps.contains(&step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub book_id: String,
    pub status: PipelineStatus,
    pub steps: Vec<StepState>,
    pub config: PipelineRunConfig,
    pub halt: Option<HaltReason>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn idle(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            status: PipelineStatus::Idle,
            steps: StepName::ORDER.into_iter().map(StepState::pending).collect(),
            config: PipelineRunConfig::default(),
            halt: None,
            updated_at: Utc::now(),
        }
    }

    pub fn step(&self, name: StepName) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn running_step(&self) -> Option<StepName> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.name)
    }

    pub fn first_pending(&self) -> Option<StepName> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.name)
    }
}
