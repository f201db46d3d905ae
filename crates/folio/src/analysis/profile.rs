//! Signal extraction over a brightness profile.

use std::ops::Range;

/// Where a spread's binding gutter is expected.
pub const CENTER_BAND: (f32, f32) = (0.40, 0.60);
/// Search windows for the falling and rising gutter edges.
pub const LEFT_EDGE_BAND: (f32, f32) = (0.35, 0.50);
pub const RIGHT_EDGE_BAND: (f32, f32) = (0.50, 0.65);
/// Share of the profile on each side used as the outer reference.
pub const OUTER_FRACTION: f32 = 0.35;

/// Index range covering `[start, end)` as fractions of `len`. Never empty
/// for `len > 0`.
pub fn band(len: usize, (start, end): (f32, f32)) -> Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let lo = ((len as f32 * start).floor() as usize).min(len - 1);
    let hi = ((len as f32 * end).floor() as usize).clamp(lo + 1, len);
    lo..hi
}

/// Index of the lowest value within `range`. Ties resolve to the leftmost.
pub fn argmin_in(values: &[f32], range: Range<usize>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for i in range.filter(|&i| i < values.len()) {
        match best {
            Some((_, v)) if values[i] >= v => {}
            _ => best = Some((i, values[i])),
        }
    }
    best.map(|(i, _)| i)
}

/// Centered moving average, window clipped at both ends.
pub fn moving_average(values: &[f32], radius: usize) -> Vec<f32> {
    let len = values.len();
    let mut prefix = Vec::with_capacity(len + 1);
    prefix.push(0.0f64);
    for v in values {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + *v as f64);
    }

    (0..len)
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(len);
            ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32
        })
        .collect()
}

/// Midpoint between the steepest fall in the left edge band and the
/// steepest rise in the right edge band of `smoothed`. `None` when either
/// side has no slope at all.
pub fn gradient_pair(smoothed: &[f32]) -> Option<f32> {
    if smoothed.len() < 3 {
        return None;
    }
    let gradient: Vec<f32> = smoothed.windows(2).map(|w| w[1] - w[0]).collect();
    let len = smoothed.len();

    let mut fall: Option<(usize, f32)> = None;
    for i in band(len, LEFT_EDGE_BAND).filter(|&i| i < gradient.len()) {
        if gradient[i] < fall.map_or(0.0, |(_, g)| g) {
            fall = Some((i, gradient[i]));
        }
    }

    let mut rise: Option<(usize, f32)> = None;
    for i in band(len, RIGHT_EDGE_BAND).filter(|&i| i < gradient.len()) {
        if gradient[i] > rise.map_or(0.0, |(_, g)| g) {
            rise = Some((i, gradient[i]));
        }
    }

    match (fall, rise) {
        (Some((l, _)), Some((r, _))) => Some((l + r) as f32 / 2.0),
        _ => None,
    }
}

/// How much darker the center band is than the outer regions, in percent.
pub fn valley_score(profile: &[f32]) -> f32 {
    let len = profile.len();
    if len < 3 {
        return 0.0;
    }

    let outer = ((len as f32 * OUTER_FRACTION).floor() as usize).max(1);
    let outer_values = profile[..outer].iter().chain(profile[len - outer..].iter());
    let outer_avg = mean(outer_values.copied());
    let center_avg = mean(band(len, CENTER_BAND).map(|i| profile[i]));

    if outer_avg <= f32::EPSILON {
        return 0.0;
    }
    (outer_avg - center_avg) / outer_avg * 100.0
}

/// Spread between the brightest and darkest values in `range`.
pub fn variation_in(values: &[f32], range: Range<usize>) -> f32 {
    let slice = &values[range.start.min(values.len())..range.end.min(values.len())];
    let max = slice.iter().copied().fold(f32::MIN, f32::max);
    let min = slice.iter().copied().fold(f32::MAX, f32::min);
    if slice.is_empty() {
        0.0
    } else {
        max - min
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}
