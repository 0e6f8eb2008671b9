//! Z-stack calibration and focus-to-distance lookup.
//!
//! A Z-stack records the Brenner value at evenly spaced Z positions around
//! the current focus. The resulting curve is modeled as a Gaussian on top of
//! a constant baseline; the inverse of that model turns an observed Brenner
//! value into the distance to the focal plane.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{FocusConfig, ZStackConfig};
use crate::error::{Result, TrackError};
use crate::stage::Stage;

/// FWHM of a Gaussian in units of sigma.
const FWHM_PER_SIGMA: f64 = 2.354_820_045;

/// Samples below this fraction of the curve height above baseline are left
/// out of the Gaussian fit; the tails are dominated by noise.
const FIT_MIN_FRACTION: f64 = 0.1;

/// One Z-stack slice.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZStackSample {
    /// Position relative to the acquisition center (µm)
    pub z_offset: f64,
    /// Mean Brenner value of the slice
    pub brenner: f64,
    /// Standard deviation of the Brenner value within the slice
    pub noise: f64,
}

/// `baseline + amplitude * exp(-(z - center)^2 / (2 sigma^2))`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
}

/// Calibrated focus curve. Read-only once built.
#[derive(Clone, Debug)]
pub struct ZStackModel {
    samples: Vec<ZStackSample>,
    fit: Option<GaussianFit>,
    baseline: f64,
    max_focus: f64,
    best_z: f64,
    upper_threshold: f64,
    lower_threshold: f64,
    full_window_size: f64,
    large_correction_step: f64,
    mean_noise: f64,
    noise_at_brenner: bool,
}

impl ZStackModel {
    pub fn from_samples(mut samples: Vec<ZStackSample>, config: &FocusConfig) -> Result<Self> {
        if samples.len() < 3 {
            return Err(TrackError::ZStack(format!(
                "need at least 3 slices, got {}",
                samples.len()
            )));
        }
        samples.sort_by(|a, b| a.z_offset.total_cmp(&b.z_offset));

        let (best_idx, best) = samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.brenner.total_cmp(&b.1.brenner))
            .map(|(i, s)| (i, *s))
            .ok_or_else(|| TrackError::ZStack("empty stack".into()))?;
        let baseline = samples
            .iter()
            .map(|s| s.brenner)
            .fold(f64::INFINITY, f64::min);

        if best.brenner - baseline <= best.brenner.abs() * 1e-9 {
            return Err(TrackError::ZStack("focus curve is flat".into()));
        }

        let fit = fit_gaussian(&samples, baseline);
        let (full_window_size, large_correction_step) = match (config.use_estimated_window, fit) {
            (true, Some(g)) => {
                let window = g.sigma * FWHM_PER_SIGMA;
                (window, window / 4.0)
            }
            _ => (config.full_window_size, config.large_correction_step),
        };
        let mean_noise = samples.iter().map(|s| s.noise).sum::<f64>() / samples.len() as f64;

        debug!(
            best_idx,
            best_z = best.z_offset,
            max = best.brenner,
            ?fit,
            "Z-stack model built"
        );

        Ok(Self {
            max_focus: best.brenner,
            best_z: best.z_offset,
            upper_threshold: best.brenner * config.upper_threshold,
            lower_threshold: best.brenner * config.lower_threshold,
            samples,
            fit,
            baseline,
            full_window_size,
            large_correction_step,
            mean_noise,
            noise_at_brenner: config.use_noise_level_at_brenner,
        })
    }

    pub fn samples(&self) -> &[ZStackSample] {
        &self.samples
    }

    pub fn fit(&self) -> Option<GaussianFit> {
        self.fit
    }

    pub fn max_focus(&self) -> f64 {
        self.max_focus
    }

    /// Z offset (relative to the acquisition center) of the sharpest slice.
    pub fn best_z(&self) -> f64 {
        self.best_z
    }

    pub fn upper_threshold_focus(&self) -> f64 {
        self.upper_threshold
    }

    pub fn lower_threshold_focus(&self) -> f64 {
        self.lower_threshold
    }

    pub fn full_window_size(&self) -> f64 {
        self.full_window_size
    }

    pub fn large_correction_step(&self) -> f64 {
        self.large_correction_step
    }

    /// Unsigned distance (µm) from the focal plane at which the model
    /// predicts `value`. Zero at or above the peak.
    pub fn correct_focus(&self, value: f64) -> f64 {
        match self.fit {
            Some(g) => {
                let height = value - self.baseline;
                if height >= g.amplitude {
                    0.0
                } else if height <= 0.0 {
                    self.full_window_size / 2.0
                } else {
                    g.sigma * (2.0 * (g.amplitude / height).ln()).sqrt()
                }
            }
            None => self.correct_focus_linear(value),
        }
    }

    /// Walk down both flanks of the measured curve and interpolate where it
    /// crosses `value`; average the flanks that do.
    fn correct_focus_linear(&self, value: f64) -> f64 {
        if value >= self.max_focus {
            return 0.0;
        }
        let best_idx = self
            .samples
            .iter()
            .position(|s| s.z_offset == self.best_z)
            .unwrap_or(0);

        let crossing = |indices: &mut dyn Iterator<Item = usize>| -> Option<f64> {
            let mut upper = self.samples[best_idx];
            for i in indices {
                let lower = self.samples[i];
                if lower.brenner <= value {
                    let t = (upper.brenner - value) / (upper.brenner - lower.brenner);
                    let z = upper.z_offset + t * (lower.z_offset - upper.z_offset);
                    return Some((z - self.best_z).abs());
                }
                upper = lower;
            }
            None
        };

        let left = crossing(&mut (0..best_idx).rev());
        let right = crossing(&mut (best_idx + 1..self.samples.len()));
        match (left, right) {
            (Some(l), Some(r)) => (l + r) / 2.0,
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => self.large_correction_step,
        }
    }

    /// Expected Brenner noise at the given focus value.
    pub fn noise_level_from_brenner(&self, value: f64) -> f64 {
        if !self.noise_at_brenner {
            return self.mean_noise;
        }

        let mut by_focus: Vec<&ZStackSample> = self.samples.iter().collect();
        by_focus.sort_by(|a, b| a.brenner.total_cmp(&b.brenner));

        let first = by_focus[0];
        let last = by_focus[by_focus.len() - 1];
        if value <= first.brenner {
            return first.noise;
        }
        if value >= last.brenner {
            return last.noise;
        }
        for pair in by_focus.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if value <= b.brenner {
                let span = b.brenner - a.brenner;
                if span <= 0.0 {
                    return b.noise;
                }
                let t = (value - a.brenner) / span;
                return a.noise + t * (b.noise - a.noise);
            }
        }
        last.noise
    }

    pub fn mean_noise(&self) -> f64 {
        self.mean_noise
    }
}

/// Least-squares parabola through `ln(brenner - baseline)` of the samples
/// near the peak. `None` when the parabola does not open downwards.
pub fn fit_gaussian(samples: &[ZStackSample], baseline: f64) -> Option<GaussianFit> {
    let peak = samples
        .iter()
        .map(|s| s.brenner - baseline)
        .fold(0.0f64, f64::max);
    let points: Vec<(f64, f64)> = samples
        .iter()
        .filter(|s| s.brenner - baseline > FIT_MIN_FRACTION * peak)
        .map(|s| (s.z_offset, (s.brenner - baseline).ln()))
        .collect();
    if points.len() < 3 {
        return None;
    }

    let n = points.len() as f64;
    let (mut sx, mut sx2, mut sx3, mut sx4) = (0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut sxy, mut sx2y) = (0.0, 0.0, 0.0);
    for &(x, y) in &points {
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }

    // Cramer's rule on the normal equations of y = a x^2 + b x + c
    let det = n * (sx2 * sx4 - sx3 * sx3) - sx * (sx * sx4 - sx2 * sx3)
        + sx2 * (sx * sx3 - sx2 * sx2);
    if det.abs() < 1e-12 {
        return None;
    }
    let det_a = n * (sx2 * sx2y - sx3 * sxy) - sx * (sx * sx2y - sx2 * sxy)
        + sy * (sx * sx3 - sx2 * sx2);
    let det_b = n * (sxy * sx4 - sx2y * sx3) - sy * (sx * sx4 - sx2 * sx3)
        + sx2 * (sx * sx2y - sxy * sx2);
    let det_c = sy * (sx2 * sx4 - sx3 * sx3) - sx * (sxy * sx4 - sx2y * sx3)
        + sx2 * (sxy * sx3 - sx2y * sx2);

    let a = det_a / det;
    let b = det_b / det;
    let c = det_c / det;
    if a >= 0.0 {
        return None;
    }

    let center = -b / (2.0 * a);
    let sigma = (-1.0 / (2.0 * a)).sqrt();
    let amplitude = (c - b * b / (4.0 * a)).exp();
    if !(sigma.is_finite() && amplitude.is_finite()) {
        return None;
    }
    Some(GaussianFit {
        amplitude,
        center,
        sigma,
    })
}

/// Result of feeding one frame to a running acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZStackStatus {
    InProgress,
    Complete,
}

#[derive(Debug)]
struct Acquisition {
    center: f64,
    positions: Vec<f64>,
    index: usize,
    /// Frames captured before this time were exposed during a move.
    moved_at_us: u64,
    pending: Vec<f64>,
    samples: Vec<ZStackSample>,
}

/// Owns the Z-stack model and runs Z-stack acquisitions.
#[derive(Debug)]
pub struct FocusTracker {
    focus: FocusConfig,
    zstack: ZStackConfig,
    z_blocking: bool,
    model: Option<ZStackModel>,
    acquisition: Option<Acquisition>,
}

impl FocusTracker {
    pub fn new(focus: FocusConfig, zstack: ZStackConfig, z_blocking: bool) -> Self {
        Self {
            focus,
            zstack,
            z_blocking,
            model: None,
            acquisition: None,
        }
    }

    /// Replace the configuration. An existing model keeps the settings it
    /// was built with.
    pub fn configure(&mut self, focus: FocusConfig, zstack: ZStackConfig, z_blocking: bool) {
        self.focus = focus;
        self.zstack = zstack;
        self.z_blocking = z_blocking;
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&ZStackModel> {
        self.model.as_ref()
    }

    /// Install a model built elsewhere, e.g. from a stored stack.
    pub fn set_model(&mut self, model: ZStackModel) {
        self.model = Some(model);
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    /// (slices done, slices total) of the running acquisition.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.acquisition
            .as_ref()
            .map(|a| (a.index, a.positions.len()))
    }

    /// Plan a stack centered on the current Z and move to its first slice.
    pub fn start_acquisition(&mut self, stage: &mut dyn Stage, now_us: u64) -> Result<()> {
        self.zstack.validate()?;
        let center = stage.z_pos();
        let count = self.zstack.slice_count();
        let first = center - self.zstack.range_um / 2.0;
        let positions: Vec<f64> = (0..count)
            .map(|i| first + i as f64 * self.zstack.step_um)
            .collect();

        stage.set_z_limits(center);
        if !stage.move_to_z(positions[0], self.z_blocking) {
            stage.clear_z_limits();
            return Err(TrackError::ZStack("stage rejected move to first slice".into()));
        }

        info!(center, slices = count, step = self.zstack.step_um, "Z-stack started");
        self.acquisition = Some(Acquisition {
            center,
            positions,
            index: 0,
            moved_at_us: now_us,
            pending: Vec::with_capacity(self.zstack.frames_per_step),
            samples: Vec::with_capacity(count),
        });
        Ok(())
    }

    /// Record the Brenner value of one frame of a running acquisition.
    ///
    /// Frames are ignored while Z is moving or when they were exposed before
    /// the last move was issued.
    pub fn process_zstack_frame(
        &mut self,
        brenner: f64,
        capture_time_us: u64,
        now_us: u64,
        stage: &mut dyn Stage,
    ) -> Result<ZStackStatus> {
        let frames_per_step = self.zstack.frames_per_step;
        let z_blocking = self.z_blocking;
        let acq = self
            .acquisition
            .as_mut()
            .ok_or_else(|| TrackError::ZStack("no acquisition in progress".into()))?;

        if stage.is_moving_z() || capture_time_us <= acq.moved_at_us {
            return Ok(ZStackStatus::InProgress);
        }

        acq.pending.push(brenner);
        if acq.pending.len() < frames_per_step {
            return Ok(ZStackStatus::InProgress);
        }

        let n = acq.pending.len() as f64;
        let mean = acq.pending.iter().sum::<f64>() / n;
        let var = acq.pending.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        acq.samples.push(ZStackSample {
            z_offset: acq.positions[acq.index] - acq.center,
            brenner: mean,
            noise: var.sqrt(),
        });
        acq.pending.clear();
        acq.index += 1;

        if acq.index < acq.positions.len() {
            if !stage.move_to_z(acq.positions[acq.index], z_blocking) {
                return Err(TrackError::ZStack("stage rejected slice move".into()));
            }
            acq.moved_at_us = now_us;
            return Ok(ZStackStatus::InProgress);
        }

        let Some(acq) = self.acquisition.take() else {
            unreachable!("acquisition checked above");
        };
        stage.clear_z_limits();
        let model = ZStackModel::from_samples(acq.samples, &self.focus)?;
        let target = acq.center + model.best_z();
        if !stage.move_to_z(target, z_blocking) {
            return Err(TrackError::ZStack("stage rejected move to best focus".into()));
        }
        info!(best_z = target, max_focus = model.max_focus(), "Z-stack acquired");
        self.model = Some(model);
        Ok(ZStackStatus::Complete)
    }

    /// Abandon a running acquisition and release the Z limits.
    pub fn cancel_acquisition(&mut self, stage: &mut dyn Stage) {
        if self.acquisition.take().is_some() {
            stage.clear_z_limits();
        }
    }

    fn model_or_default<T>(&self, f: impl FnOnce(&ZStackModel) -> T, default: T) -> T {
        self.model.as_ref().map(f).unwrap_or(default)
    }

    pub fn correct_focus(&self, value: f64) -> f64 {
        self.model_or_default(|m| m.correct_focus(value), 0.0)
    }

    pub fn upper_threshold_focus(&self) -> f64 {
        self.model_or_default(|m| m.upper_threshold_focus(), f64::INFINITY)
    }

    pub fn lower_threshold_focus(&self) -> f64 {
        self.model_or_default(|m| m.lower_threshold_focus(), f64::INFINITY)
    }

    pub fn large_correction_step(&self) -> f64 {
        self.model_or_default(
            |m| m.large_correction_step(),
            self.focus.large_correction_step,
        )
    }

    pub fn full_window_size(&self) -> f64 {
        self.model_or_default(|m| m.full_window_size(), self.focus.full_window_size)
    }

    pub fn max_focus(&self) -> f64 {
        self.model_or_default(|m| m.max_focus(), 0.0)
    }

    pub fn noise_level_from_brenner(&self, value: f64) -> f64 {
        self.model_or_default(|m| m.noise_level_from_brenner(value), 0.0)
    }
}
