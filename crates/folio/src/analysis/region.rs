//! Content region detection and brightness profiling.
//!
//! Scanned spreads usually carry black borders from the scanner bed. The
//! region analyzer trims those borders and collapses what remains into a
//! one-dimensional brightness signal whose low points mark candidate gutters.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};

/// Tunables for region detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionParams {
    /// Width images are downsampled to before analysis.
    pub analysis_width: u32,
    /// Luminance below this value counts as a dark (border) pixel.
    pub dark_threshold: u8,
    /// Fraction of non-dark pixels a column needs to count as content.
    pub coverage_threshold: f32,
    /// Fraction of the width scanned inward from each edge.
    pub edge_scan_fraction: f32,
}

impl Default for RegionParams {
    fn default() -> Self {
        Self {
            analysis_width: 800,
            dark_threshold: 40,
            coverage_threshold: 0.30,
            edge_scan_fraction: 0.30,
        }
    }
}

/// Inclusive column range holding page content, in analysis coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRegion {
    pub left: u32,
    pub right: u32,
}

impl ContentRegion {
    pub fn full(width: u32) -> Self {
        Self {
            left: 0,
            right: width.saturating_sub(1),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left) + 1
    }
}

/// Downsamples to the analysis width (never upsamples) and converts to
/// 8-bit luminance.
pub fn prepare(image: &DynamicImage, analysis_width: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if analysis_width == 0 || width <= analysis_width {
        return image.to_luma8();
    }

    let scaled_height = (height as f64 * analysis_width as f64 / width as f64)
        .round()
        .max(1.0) as u32;
    image
        .resize_exact(analysis_width, scaled_height, FilterType::Triangle)
        .to_luma8()
}

pub fn find_content_region(gray: &GrayImage, params: &RegionParams) -> ContentRegion {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return ContentRegion::full(width);
    }

    let scan = ((width as f32 * params.edge_scan_fraction).ceil() as u32).clamp(1, width);
    let is_content = |x: u32| column_coverage(gray, x, params.dark_threshold) > params.coverage_threshold;

    let left = (0..scan).find(|&x| is_content(x)).unwrap_or(0);
    let right = (width - scan..width)
        .rev()
        .find(|&x| is_content(x))
        .unwrap_or(width - 1);

    if left >= right {
        return ContentRegion::full(width);
    }

    ContentRegion { left, right }
}

/// Mean luminance of every column in the region, averaged over all rows.
pub fn vertical_profile(gray: &GrayImage, region: ContentRegion) -> Vec<f32> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let right = region.right.min(width - 1);
    (region.left..=right)
        .map(|x| {
            let sum: u64 = (0..height).map(|y| gray.get_pixel(x, y)[0] as u64).sum();
            sum as f32 / height as f32
        })
        .collect()
}

fn column_coverage(gray: &GrayImage, x: u32, dark_threshold: u8) -> f32 {
    let height = gray.height();
    let lit = (0..height)
        .filter(|&y| gray.get_pixel(x, y)[0] >= dark_threshold)
        .count();
    lit as f32 / height as f32
}
