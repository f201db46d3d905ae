//! Per-book processing pipeline: persistent state, transitions and the
//! driver that feeds running steps to the job processor.

pub mod driver;
pub mod error;
pub mod machine;
pub mod progress;
pub mod state;

pub use driver::{DriveOutcome, PipelineDriver};
pub use error::PipelineError;
pub use machine::{AdvanceOutcome, PipelineMachine, PipelineSnapshot};
pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter};
pub use state::{
    ExecutionMode, HaltReason, PipelineRunConfig, PipelineState, PipelineStatus, StepKind,
    StepName, StepState, StepStatus,
};
