//! Resumable units of work and the executors that run them.

pub mod edition;
pub mod job;
pub mod processor;
pub mod steps;

pub use edition::EditionStep;
pub use job::Job;
pub use processor::{ChunkOutcome, JobProcessor, JobSettings};
pub use steps::{
    AtomicStep, ItemOutput, OcrStep, PageStep, SplitCheckStep, StepError, SummarizeStep,
    TranslateStep,
};
