use ndarray::{s, Array2, ArrayView2};

use crate::consts::MAD_TO_SIGMA;

/// Rectangular region of interest, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
}

impl Roi {
    pub fn view<'a>(&self, data: &'a Array2<f32>) -> ArrayView2<'a, f32> {
        data.slice(s![
            self.row..self.row + self.height,
            self.col..self.col + self.width
        ])
    }
}

/// Centered crop covering `percentage` (0, 100] of each image dimension.
pub fn centered_roi(height: usize, width: usize, percentage: f64) -> Roi {
    let fraction = (percentage / 100.0).clamp(0.0, 1.0);
    let roi_h = ((height as f64 * fraction).round() as usize).clamp(1, height.max(1));
    let roi_w = ((width as f64 * fraction).round() as usize).clamp(1, width.max(1));
    Roi {
        row: (height - roi_h.min(height)) / 2,
        col: (width - roi_w.min(width)) / 2,
        height: roi_h.min(height),
        width: roi_w.min(width),
    }
}

/// Brenner gradient: sum of `(p[x+n, y] - p[x, y])^2` over the image.
///
/// Squared differences not exceeding `threshold` are ignored, which is the
/// classic Brenner definition for `threshold > 0`. Pixel values are scaled to
/// 8-bit range so that the result does not depend on the [0, 1] normalization
/// being tiny.
pub fn brenner_value(data: &ArrayView2<f32>, n: usize, threshold: f64) -> f64 {
    let (h, w) = data.dim();
    if n == 0 || w <= n {
        return 0.0;
    }

    let mut sum = 0.0f64;
    for row in 0..h {
        for col in 0..w - n {
            let diff = (data[[row, col + n]] as f64 - data[[row, col]] as f64) * 255.0;
            let sq = diff * diff;
            if sq > threshold {
                sum += sq;
            }
        }
    }
    sum
}

pub fn max_intensity(data: &ArrayView2<f32>) -> f64 {
    data.iter().fold(0.0f64, |acc, &v| acc.max(v as f64))
}

/// Robust estimate of per-pixel noise (σ, 8-bit scale): median absolute
/// deviation of horizontal first differences.
pub fn noise_level(data: &ArrayView2<f32>) -> f64 {
    let (h, w) = data.dim();
    if w < 2 || h == 0 {
        return 0.0;
    }

    let mut diffs: Vec<f64> = Vec::with_capacity(h * (w - 1));
    for row in 0..h {
        for col in 0..w - 1 {
            diffs.push(((data[[row, col + 1]] - data[[row, col]]) as f64 * 255.0).abs());
        }
    }
    let mid = diffs.len() / 2;
    let (_, median, _) = diffs.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *median * MAD_TO_SIGMA / std::f64::consts::SQRT_2
}

/// Scalar focus metrics of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FocusMetrics {
    pub brenner: f64,
    /// `ln(1 + brenner)`
    pub focus: f64,
    pub max_intensity: f64,
    pub noise_level: f64,
}

impl FocusMetrics {
    pub fn compute(data: &ArrayView2<f32>, n: usize, threshold: f64) -> Self {
        let brenner = brenner_value(data, n, threshold);
        Self {
            brenner,
            focus: brenner.ln_1p(),
            max_intensity: max_intensity(data),
            noise_level: noise_level(data),
        }
    }
}
