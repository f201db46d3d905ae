//! Spread detection for scanned page images.
//!
//! [`region`] trims scanner borders and builds a brightness profile,
//! [`profile`] extracts gutter signals from it, and [`split`] combines the
//! [`estimators`] into a spread/single decision with a cut position.

pub mod estimators;
pub mod profile;
pub mod region;
pub mod split;

pub use estimators::{EdgeMeasurements, SignalEstimator};
pub use region::{ContentRegion, RegionParams};
pub use split::{Confidence, SplitAnalysis, SplitDetector, SplitTuning};
