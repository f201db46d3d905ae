use std::fmt;

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

use super::estimators::{
    AspectRatioSignal, ContentWidthSignal, EdgeMeasurements, GradientPairSignal, SignalEstimator,
    ValleyDepthSignal,
};
use super::profile::{self, CENTER_BAND};
use super::region::{self, ContentRegion, RegionParams};

/// Center-band brightness variation below which a profile counts as flat.
const FLAT_VARIATION: f32 = 0.5;
/// Upper bound of the combined score.
const MAX_SCORE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn from_score(score: f32) -> Self {
        if score >= 2.0 {
            Confidence::High
        } else if score >= 1.0 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weights and thresholds for spread classification.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitTuning {
    pub region: RegionParams,
    pub smoothing_radius: usize,
    pub aspect_landscape: f32,
    pub aspect_borderline: f32,
    pub valley_strong: f32,
    pub valley_weak: f32,
    pub valley_strong_above: f32,
    pub valley_weak_above: f32,
    pub content_width: f32,
    pub content_width_below: f32,
    pub gradient_pair: f32,
    pub spread_threshold: f32,
}

impl Default for SplitTuning {
    fn default() -> Self {
        Self {
            region: RegionParams::default(),
            smoothing_radius: 30,
            aspect_landscape: 1.0,
            aspect_borderline: 0.5,
            valley_strong: 1.0,
            valley_weak: 0.5,
            valley_strong_above: 5.0,
            valley_weak_above: 2.0,
            content_width: 0.5,
            content_width_below: 0.95,
            gradient_pair: 0.0,
            spread_threshold: 1.5,
        }
    }
}

impl From<&AnalysisConfig> for SplitTuning {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            region: RegionParams {
                analysis_width: config.analysis_width,
                dark_threshold: config.dark_threshold,
                coverage_threshold: config.coverage_threshold,
                edge_scan_fraction: config.edge_scan_fraction,
            },
            smoothing_radius: config.smoothing_radius,
            aspect_landscape: config.aspect_landscape,
            aspect_borderline: config.aspect_borderline,
            valley_strong: config.valley_strong,
            valley_weak: config.valley_weak,
            content_width: config.content_width,
            gradient_pair: config.gradient_pair,
            spread_threshold: config.spread_threshold,
            ..Self::default()
        }
    }
}

/// Outcome of classifying one image. Produced fresh per image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitAnalysis {
    pub is_spread: bool,
    pub confidence: Confidence,
    /// Cut position as a percentage of the content region, in `[0, 100]`.
    pub cut_percent: f32,
    pub score: f32,
    pub measurements: EdgeMeasurements,
    /// Content region in analysis coordinates.
    #[serde(skip)]
    pub region: Option<ContentRegion>,
    /// Width of the downsampled analysis image.
    pub analysis_width: u32,
}

impl SplitAnalysis {
    fn degraded(measurements: EdgeMeasurements, analysis_width: u32) -> Self {
        Self {
            is_spread: false,
            confidence: Confidence::Low,
            cut_percent: 50.0,
            score: 0.0,
            measurements,
            region: None,
            analysis_width,
        }
    }

    /// Cut column in the coordinates of an image `image_width` pixels wide.
    pub fn cut_column(&self, image_width: u32) -> u32 {
        if image_width == 0 {
            return 0;
        }
        let region = self
            .region
            .unwrap_or_else(|| ContentRegion::full(self.analysis_width));
        let span = region.width().saturating_sub(1) as f32;
        let analysis_x = region.left as f32 + self.cut_percent / 100.0 * span;
        let scale = if self.analysis_width == 0 {
            1.0
        } else {
            image_width as f32 / self.analysis_width as f32
        };
        ((analysis_x * scale).round() as u32).min(image_width - 1)
    }
}

/// Decides whether a scan is a two-page spread and where to cut it.
///
/// Pure and `Sync`: one detector can serve concurrent callers.
pub struct SplitDetector {
    tuning: SplitTuning,
    estimators: Vec<Box<dyn SignalEstimator>>,
}

impl SplitDetector {
    pub fn new(tuning: SplitTuning) -> Self {
        let estimators: Vec<Box<dyn SignalEstimator>> = vec![
            Box::new(AspectRatioSignal {
                landscape: tuning.aspect_landscape,
                borderline: tuning.aspect_borderline,
            }),
            Box::new(ValleyDepthSignal {
                strong: tuning.valley_strong,
                weak: tuning.valley_weak,
                strong_above: tuning.valley_strong_above,
                weak_above: tuning.valley_weak_above,
            }),
            Box::new(ContentWidthSignal {
                weight: tuning.content_width,
                below: tuning.content_width_below,
            }),
            Box::new(GradientPairSignal {
                weight: tuning.gradient_pair,
            }),
        ];
        Self { tuning, estimators }
    }

    /// Replaces the default signal set.
    pub fn with_estimators(tuning: SplitTuning, estimators: Vec<Box<dyn SignalEstimator>>) -> Self {
        Self { tuning, estimators }
    }

    pub fn tuning(&self) -> &SplitTuning {
        &self.tuning
    }

    /// Decodes and classifies. Undecodable bytes are the only error.
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<SplitAnalysis, AnalysisError> {
        let image =
            image::load_from_memory(bytes).map_err(|e| AnalysisError::Decode(e.to_string()))?;
        Ok(self.classify(&image))
    }

    pub fn classify(&self, image: &DynamicImage) -> SplitAnalysis {
        let (width, height) = image.dimensions();
        let gray = region::prepare(image, self.tuning.region.analysis_width);
        let analysis_width = gray.width();
        let content = region::find_content_region(&gray, &self.tuning.region);
        let profile = region::vertical_profile(&gray, content);

        let aspect_ratio = if height == 0 {
            0.0
        } else {
            width as f32 / height as f32
        };
        let content_ratio = if analysis_width == 0 {
            1.0
        } else {
            content.width() as f32 / analysis_width as f32
        };

        let mut measurements = EdgeMeasurements {
            aspect_ratio,
            content_ratio,
            profile_len: profile.len(),
            simple_min: None,
            smoothed_min: None,
            gradient_cut: None,
            valley_score: 0.0,
        };

        if profile.len() < 3 {
            tracing::debug!(width, height, "profile too short, degrading");
            return SplitAnalysis::degraded(measurements, analysis_width);
        }

        let center = profile::band(profile.len(), CENTER_BAND);
        let smoothed = profile::moving_average(&profile, self.tuning.smoothing_radius);
        measurements.simple_min = profile::argmin_in(&profile, center.clone());
        measurements.smoothed_min = profile::argmin_in(&smoothed, center.clone());
        measurements.gradient_cut = profile::gradient_pair(&smoothed);
        measurements.valley_score = profile::valley_score(&profile);

        let score = self
            .estimators
            .iter()
            .map(|e| {
                let c = e.contribution(&measurements);
                tracing::trace!(signal = e.name(), contribution = c);
                c
            })
            .sum::<f32>()
            .clamp(0.0, MAX_SCORE);

        let flat = profile::variation_in(&smoothed, center) < FLAT_VARIATION;
        let cut_percent = match measurements.smoothed_min {
            Some(idx) if !flat => idx as f32 / (profile.len() - 1) as f32 * 100.0,
            _ => 50.0,
        }
        .clamp(0.0, 100.0);

        let is_spread = score >= self.tuning.spread_threshold;
        let confidence = Confidence::from_score(score);

        tracing::debug!(
            is_spread,
            %confidence,
            score,
            cut_percent,
            valley = measurements.valley_score,
            "split analysis"
        );

        SplitAnalysis {
            is_spread,
            confidence,
            cut_percent,
            score,
            measurements,
            region: Some(content),
            analysis_width,
        }
    }
}

impl Default for SplitDetector {
    fn default() -> Self {
        Self::new(SplitTuning::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    /// White page with a cosine-shaped gutter of `depth` centered at `at`.
    fn spread(width: u32, height: u32, depth: f32, at: f32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, _| {
            let offset = x as f32 / width as f32 - at;
            let dip = if offset.abs() < 0.1 {
                0.5 * (1.0 + (std::f32::consts::PI * offset / 0.1).cos())
            } else {
                0.0
            };
            Luma([(220.0 * (1.0 - depth * dip)) as u8])
        }))
    }

    #[test]
    fn test_single_page_without_gutter() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(350, 500, Luma([200])));
        let analysis = SplitDetector::default().classify(&image);
        assert!(!analysis.is_spread);
        assert_ne!(analysis.confidence, Confidence::High);
        assert!(analysis.measurements.valley_score < 2.0);
        assert_eq!(analysis.cut_percent, 50.0);
    }

    #[test]
    fn test_clear_spread() {
        let image = spread(650, 500, 0.30, 0.5);
        let analysis = SplitDetector::default().classify(&image);
        assert!(analysis.is_spread);
        assert_eq!(analysis.confidence, Confidence::High);
        assert!(
            (40.0..=60.0).contains(&analysis.cut_percent),
            "cut was {}",
            analysis.cut_percent
        );
        assert_eq!(analysis.measurements.content_ratio, 1.0);
    }

    #[test]
    fn test_shallow_gutter_on_landscape_scan() {
        // 650x500 (aspect 1.3), gutter 15% darker than the page.
        let image = spread(650, 500, 0.15, 0.5);
        let analysis = SplitDetector::default().classify(&image);
        assert!(analysis.is_spread);
        assert_eq!(analysis.confidence, Confidence::High);
        assert!(analysis.measurements.valley_score > 5.0);
        assert!(
            (45.0..=55.0).contains(&analysis.cut_percent),
            "cut was {}",
            analysis.cut_percent
        );
    }

    #[test]
    fn test_off_center_gutter_tracks_minimum() {
        let image = spread(650, 500, 0.40, 0.45);
        let analysis = SplitDetector::default().classify(&image);
        assert!(analysis.cut_percent < 50.0);
        assert!(analysis.cut_percent >= 40.0);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let image = spread(640, 480, 0.2, 0.52);
        let detector = SplitDetector::default();
        let first = detector.classify(&image);
        for _ in 0..3 {
            assert_eq!(detector.classify(&image), first);
        }
    }

    #[test]
    fn test_tiny_image_degrades() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([255])));
        let analysis = SplitDetector::default().classify(&image);
        assert!(!analysis.is_spread);
        assert_eq!(analysis.confidence, Confidence::Low);
        assert_eq!(analysis.cut_percent, 50.0);
    }

    #[test]
    fn test_undecodable_bytes_error() {
        let result = SplitDetector::default().classify_bytes(b"definitely not an image");
        assert!(matches!(result, Err(AnalysisError::Decode(_))));
    }

    #[test]
    fn test_cut_percent_in_bounds_for_varied_inputs() {
        let detector = SplitDetector::default();
        let images = [
            spread(300, 400, 0.9, 0.41),
            spread(900, 300, 0.05, 0.59),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 500, Luma([0]))),
            DynamicImage::ImageLuma8(GrayImage::from_fn(400, 100, |x, _| Luma([(x % 256) as u8]))),
        ];
        for image in &images {
            let analysis = detector.classify(image);
            assert!((0.0..=100.0).contains(&analysis.cut_percent));
            assert!((0.0..=2.0).contains(&analysis.score));
        }
    }

    #[test]
    fn test_cut_column_maps_to_original_width() {
        let image = spread(1600, 1200, 0.3, 0.5);
        let analysis = SplitDetector::default().classify(&image);
        assert_eq!(analysis.analysis_width, 800);
        let cut = analysis.cut_column(1600);
        assert!((700..=900).contains(&cut), "cut column was {cut}");
    }

    #[test]
    fn test_custom_estimators_replace_defaults() {
        struct Always;
        impl SignalEstimator for Always {
            fn name(&self) -> &'static str {
                "always"
            }
            fn contribution(&self, _m: &EdgeMeasurements) -> f32 {
                5.0
            }
        }

        let detector = SplitDetector::with_estimators(SplitTuning::default(), vec![Box::new(Always)]);
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 100, Luma([128])));
        let analysis = detector.classify(&image);
        assert!(analysis.is_spread);
        assert_eq!(analysis.score, 2.0);
        assert_eq!(analysis.confidence, Confidence::High);
    }
}
