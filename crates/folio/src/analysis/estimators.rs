//! Pluggable signals combined into the spread score.

use serde::{Deserialize, Serialize};

use super::profile::CENTER_BAND;

/// Everything the detector measured about one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMeasurements {
    /// Width over height of the original image.
    pub aspect_ratio: f32,
    /// Content region width over analysis width.
    pub content_ratio: f32,
    /// Length of the brightness profile.
    pub profile_len: usize,
    /// Darkest raw column in the center band.
    pub simple_min: Option<usize>,
    /// Darkest smoothed column in the center band.
    pub smoothed_min: Option<usize>,
    /// Midpoint of the steepest falling/rising edge pair.
    pub gradient_cut: Option<f32>,
    /// Center darkness relative to the outer regions, in percent.
    pub valley_score: f32,
}

pub trait SignalEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score contributed by this signal. Zero means "no evidence of a spread".
    fn contribution(&self, m: &EdgeMeasurements) -> f32;
}

/// Landscape images are usually spreads.
pub struct AspectRatioSignal {
    pub landscape: f32,
    pub borderline: f32,
}

impl SignalEstimator for AspectRatioSignal {
    fn name(&self) -> &'static str {
        "aspect_ratio"
    }

    fn contribution(&self, m: &EdgeMeasurements) -> f32 {
        if m.aspect_ratio > 1.0 {
            self.landscape
        } else if m.aspect_ratio >= 0.9 {
            self.borderline
        } else {
            0.0
        }
    }
}

/// A binding shadow darkens the middle of the profile.
pub struct ValleyDepthSignal {
    pub strong: f32,
    pub weak: f32,
    pub strong_above: f32,
    pub weak_above: f32,
}

impl SignalEstimator for ValleyDepthSignal {
    fn name(&self) -> &'static str {
        "valley_depth"
    }

    fn contribution(&self, m: &EdgeMeasurements) -> f32 {
        if m.valley_score > self.strong_above {
            self.strong
        } else if m.valley_score > self.weak_above {
            self.weak
        } else {
            0.0
        }
    }
}

/// Trimmed scanner borders hint at a flatbed spread scan.
pub struct ContentWidthSignal {
    pub weight: f32,
    pub below: f32,
}

impl SignalEstimator for ContentWidthSignal {
    fn name(&self) -> &'static str {
        "content_width"
    }

    fn contribution(&self, m: &EdgeMeasurements) -> f32 {
        if m.content_ratio < self.below {
            self.weight
        } else {
            0.0
        }
    }
}

/// Edge pair landing inside the center band. Weighted zero by default and
/// kept for diagnostics.
pub struct GradientPairSignal {
    pub weight: f32,
}

impl SignalEstimator for GradientPairSignal {
    fn name(&self) -> &'static str {
        "gradient_pair"
    }

    fn contribution(&self, m: &EdgeMeasurements) -> f32 {
        let Some(cut) = m.gradient_cut else {
            return 0.0;
        };
        if m.profile_len == 0 {
            return 0.0;
        }
        let fraction = cut / m.profile_len as f32;
        if fraction >= CENTER_BAND.0 && fraction < CENTER_BAND.1 {
            self.weight
        } else {
            0.0
        }
    }
}
