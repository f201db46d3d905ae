pub mod analysis;
pub mod app;
pub mod config;
pub mod contribute;
pub mod db;
pub mod error;
pub mod governor;
pub mod inference;
pub mod ingest;
pub mod jobs;
pub mod pipeline;
pub mod sanitize;
pub mod secrets;
pub mod storage;
pub mod telemetry;

pub use analysis::{Confidence, SplitAnalysis, SplitDetector, SplitTuning};
pub use app::Folio;
pub use config::{load_config, Config};
pub use contribute::{ContributionReport, ContributorSession};
pub use error::{
    AnalysisError, ConfigError, FolioError, IngestError, Result, StorageError,
};
pub use governor::{Charge, CostGovernor};
pub use ingest::{ImageInput, IngestReport};
pub use pipeline::{DriveOutcome, PipelineError, PipelineRunConfig, PipelineStatus, StepName};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
