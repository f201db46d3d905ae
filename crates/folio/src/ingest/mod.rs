//! Split-aware ingestion of scanned images.

pub mod classifier;
pub mod ingestor;
pub mod source;

pub use classifier::{ClassifyInput, DetectorClassifier, SpreadClassifier, VisionClassifier};
pub use ingestor::{ImageInput, IngestReport, IngestSettings, Ingestor, SkippedImage};
pub use source::{AnyImageSource, FetchedImage, FsImageSource, HttpImageSource, ImageSource};
