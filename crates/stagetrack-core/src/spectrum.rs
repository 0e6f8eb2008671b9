use ndarray::{s, Array2, Zip};
use num_complex::Complex;
use num_traits::Zero;

use crate::consts::{DC_SMOOTHING, EPSILON};
use crate::error::{Result, TrackError};
use crate::fft::FftPlan;
use crate::focus::{centered_roi, FocusMetrics, FocusValue};
use crate::frame::{Frame, PixelPos, Vec2};

/// One frame in the form used for displacement correlation and focus scoring.
///
/// Slots are recycled by the correlator: every buffer keeps its allocation
/// across `assign_*` calls as long as the frame size does not change.
#[derive(Clone, Debug)]
pub struct SpectrumImage {
    spectrum: Array2<Complex<f64>>,
    focus_pixels: Array2<f32>,
    roi_percentage: f64,
    offset: Vec2,
    metrics: FocusMetrics,
}

impl SpectrumImage {
    pub fn new(width: usize, height: usize, roi_percentage: f64) -> Self {
        Self {
            spectrum: Array2::zeros((height, width)),
            focus_pixels: Array2::zeros((0, 0)),
            roi_percentage,
            offset: Vec2::ZERO,
            metrics: FocusMetrics::default(),
        }
    }

    pub fn width(&self) -> usize {
        self.spectrum.ncols()
    }

    pub fn height(&self) -> usize {
        self.spectrum.nrows()
    }

    /// Transform the top-left computation region of `frame` into the
    /// frequency domain after removing the running DC value.
    ///
    /// Returns the updated DC estimate for the next call. The estimate moves
    /// towards the current frame mean instead of jumping to it, so a sudden
    /// illumination change cannot make consecutive spectra oscillate.
    pub fn assign_and_transform(
        &mut self,
        frame: &Frame,
        plan: &FftPlan,
        previous_dc: Option<f64>,
    ) -> Result<f64> {
        let (h, w) = self.spectrum.dim();
        check_frame_size(frame, w, h)?;

        let region = frame.data.slice(s![..h, ..w]);
        let mean = region.iter().map(|&v| v as f64).sum::<f64>() / (w * h) as f64;
        let dc = match previous_dc {
            Some(prev) => prev + DC_SMOOTHING * (mean - prev),
            None => mean,
        };

        Zip::from(&mut self.spectrum)
            .and(&region)
            .for_each(|out, &px| *out = Complex::new(px as f64 - dc, 0.0));
        plan.forward(&mut self.spectrum);

        self.assign_z(frame);
        Ok(dc)
    }

    /// Refresh only the pixels used for focus metrics (no transform).
    pub fn assign_z(&mut self, frame: &Frame) {
        let roi = centered_roi(frame.height(), frame.width(), self.roi_percentage);
        let view = roi.view(&frame.data);
        if self.focus_pixels.dim() == view.dim() {
            self.focus_pixels.assign(&view);
        } else {
            self.focus_pixels = view.to_owned();
        }
    }

    /// Compute and store the Brenner gradient (and the metrics derived
    /// alongside it) over the focus ROI.
    pub fn extract_focus_brenner(&mut self, n: usize, threshold: f64) -> FocusMetrics {
        self.metrics = FocusMetrics::compute(&self.focus_pixels.view(), n, threshold);
        self.metrics
    }

    pub fn metrics(&self) -> FocusMetrics {
        self.metrics
    }

    /// Focus snapshot of this image alone; averages equal the raw values.
    pub fn focus(&self) -> FocusValue {
        FocusValue {
            brenner: self.metrics.brenner,
            focus: self.metrics.focus,
            avg_brenner: self.metrics.brenner,
            avg_focus: self.metrics.focus,
            max_intensity: self.metrics.max_intensity,
            noise_level: self.metrics.noise_level,
        }
    }

    pub fn offset(&self) -> Vec2 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: Vec2) {
        self.offset = offset;
    }

    pub fn reset_offset(&mut self) {
        self.offset = Vec2::ZERO;
    }

    pub fn spectrum(&self) -> &Array2<Complex<f64>> {
        &self.spectrum
    }

    /// Log-magnitude of the spectrum with DC moved to the center, scaled to
    /// [0, 1]. Only used for previews.
    pub fn magnitude_image(&self) -> Array2<f32> {
        let (h, w) = self.spectrum.dim();
        let mut out = Array2::<f32>::zeros((h, w));
        let mut max = 0.0f64;
        for ((row, col), v) in self.spectrum.indexed_iter() {
            let mag = v.norm().ln_1p();
            max = max.max(mag);
            out[[(row + h / 2) % h, (col + w / 2) % w]] = mag as f32;
        }
        if max > EPSILON {
            out.mapv_inplace(|v| (v as f64 / max) as f32);
        }
        out
    }
}

pub(crate) fn check_frame_size(frame: &Frame, width: usize, height: usize) -> Result<()> {
    if frame.width() < width || frame.height() < height {
        return Err(TrackError::FrameTooSmall {
            width: frame.width(),
            height: frame.height(),
            required_width: width,
            required_height: height,
        });
    }
    Ok(())
}

/// Normalized cross-power spectrum `current * conj(previous) / |...|`,
/// inverse transformed into `surface`. `work` is scratch of the same shape.
pub fn correlation_surface_into(
    current: &SpectrumImage,
    previous: &SpectrumImage,
    plan: &FftPlan,
    work: &mut Array2<Complex<f64>>,
    surface: &mut Array2<f64>,
) {
    Zip::from(&mut *work)
        .and(current.spectrum())
        .and(previous.spectrum())
        .for_each(|out, &c, &p| {
            let cross = c * p.conj();
            let mag = cross.norm();
            *out = if mag > EPSILON {
                cross / mag
            } else {
                Complex::zero()
            };
        });

    plan.inverse(work);

    Zip::from(surface).and(&*work).for_each(|s, w| *s = w.re);
}

/// Allocating variant of [`correlation_surface_into`].
pub fn correlation_surface(
    current: &SpectrumImage,
    previous: &SpectrumImage,
    plan: &FftPlan,
) -> Array2<f64> {
    let dim = current.spectrum().dim();
    let mut work = Array2::zeros(dim);
    let mut surface = Array2::zeros(dim);
    correlation_surface_into(current, previous, plan, &mut work, &mut surface);
    surface
}

/// Integer location of the highest value of a correlation surface.
pub fn spatial_maximum(surface: &Array2<f64>) -> PixelPos {
    let mut best = PixelPos::default();
    let mut best_val = f64::NEG_INFINITY;
    for ((row, col), &v) in surface.indexed_iter() {
        if v > best_val {
            best_val = v;
            best = PixelPos { x: col, y: row };
        }
    }
    best
}

/// Map a correlation peak to a signed shift. A DFT correlation is periodic,
/// so a peak beyond half the size is a negative shift.
pub fn unwrap_periodic(peak: PixelPos, width: usize, height: usize) -> Vec2 {
    let mut x = peak.x as f64;
    let mut y = peak.y as f64;
    if peak.x > width / 2 {
        x -= width as f64;
    }
    if peak.y > height / 2 {
        y -= height as f64;
    }
    Vec2::new(x, y)
}

/// Fractional peak position from 1D parabola fits through the peak and its
/// periodic neighbors. Returns (dx, dy) clamped to ±0.5 px.
pub fn refine_peak_paraboloid(surface: &Array2<f64>, peak: PixelPos) -> Vec2 {
    let (h, w) = surface.dim();
    if h < 3 || w < 3 {
        return Vec2::ZERO;
    }

    let centre = surface[[peak.y, peak.x]];
    let left = surface[[peak.y, (peak.x + w - 1) % w]];
    let right = surface[[peak.y, (peak.x + 1) % w]];
    let up = surface[[(peak.y + h - 1) % h, peak.x]];
    let down = surface[[(peak.y + 1) % h, peak.x]];

    let vertex = |prev: f64, next: f64| {
        let denom = prev - 2.0 * centre + next;
        if denom.abs() > EPSILON {
            ((prev - next) / (2.0 * denom)).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    };

    Vec2::new(vertex(left, right), vertex(up, down))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_keeps_small_positive_shifts() {
        let v = unwrap_periodic(PixelPos { x: 3, y: 32 }, 64, 64);
        assert_eq!(v, Vec2::new(3.0, 32.0));
    }

    #[test]
    fn unwrap_maps_far_side_to_negative() {
        let v = unwrap_periodic(PixelPos { x: 61, y: 33 }, 64, 64);
        assert_eq!(v, Vec2::new(-3.0, -31.0));
    }

    #[test]
    fn paraboloid_symmetric_peak_has_no_fraction() {
        let mut surface = Array2::<f64>::zeros((5, 5));
        surface[[0, 0]] = 1.0;
        surface[[0, 1]] = 0.5;
        surface[[0, 4]] = 0.5;
        let d = refine_peak_paraboloid(&surface, PixelPos { x: 0, y: 0 });
        assert!(d.x.abs() < 1e-12);
    }

    #[test]
    fn paraboloid_leans_towards_larger_neighbor() {
        let mut surface = Array2::<f64>::zeros((5, 5));
        surface[[2, 2]] = 1.0;
        surface[[2, 3]] = 0.8;
        surface[[2, 1]] = 0.2;
        let d = refine_peak_paraboloid(&surface, PixelPos { x: 2, y: 2 });
        assert!(d.x > 0.0 && d.x <= 0.5);
    }
}
