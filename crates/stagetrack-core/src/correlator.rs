//! Rolling phase-correlation tracker.
//!
//! The correlator keeps the spectra of the last `track_depth` frames in a
//! ring of recycled slots and compares each new frame against all of them.
//! Every pairwise peak predicts the same absolute displacement; predictions
//! that disagree with the most recent comparison are dropped before
//! averaging.

use ndarray::Array2;
use num_complex::Complex;
use tracing::trace;

use crate::config::{CorrelatorConfig, FocusConfig};
use crate::consts::{
    CONSENSUS_MIN_PREDICTION_PX, CONSENSUS_PLAUSIBLE_FRACTION, CONSENSUS_RELATIVE_TOLERANCE,
};
use crate::error::Result;
use crate::fft::FftPlan;
use crate::focus::{FocusAverager, FocusMetrics, FocusValue};
use crate::frame::{Frame, Vec2};
use crate::spectrum::{
    correlation_surface_into, refine_peak_paraboloid, spatial_maximum, unwrap_periodic,
    SpectrumImage,
};

/// Focus settings the correlator needs from [`FocusConfig`].
#[derive(Clone, Copy, Debug)]
struct BrennerSettings {
    enabled: bool,
    offset: usize,
    threshold: f64,
}

pub struct Correlator {
    config: CorrelatorConfig,
    brenner: BrennerSettings,
    plan: FftPlan,
    /// `track_depth + 1` slots; `cursor` is the current image.
    slots: Vec<SpectrumImage>,
    cursor: usize,
    images_tracked: usize,
    dc_value: Option<f64>,
    work: Array2<Complex<f64>>,
    surface: Array2<f64>,
    snapshot: SpectrumImage,
    avg_brenner: FocusAverager,
    avg_focus: FocusAverager,
    last_focus: FocusValue,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("config", &self.config)
            .field("images_tracked", &self.images_tracked)
            .finish()
    }
}

impl Correlator {
    /// Build a correlator, planning the FFTs for the configured size.
    /// Planning can be slow; see `controller::rebuild` for the background path.
    pub fn new(config: &CorrelatorConfig, focus: &FocusConfig) -> Result<Self> {
        config.validate()?;
        focus.validate()?;

        let (w, h) = (config.fft_width, config.fft_height);
        let plan = FftPlan::new(w, h);
        let slots = (0..=config.track_depth)
            .map(|_| SpectrumImage::new(w, h, focus.roi_percentage))
            .collect();

        Ok(Self {
            config: config.clone(),
            brenner: BrennerSettings {
                enabled: focus.brenner_enabled,
                offset: focus.brenner_offset,
                threshold: focus.brenner_threshold,
            },
            plan,
            slots,
            cursor: 0,
            images_tracked: 0,
            dc_value: None,
            work: Array2::zeros((h, w)),
            surface: Array2::zeros((h, w)),
            snapshot: SpectrumImage::new(w, h, focus.roi_percentage),
            avg_brenner: FocusAverager::default(),
            avg_focus: FocusAverager::default(),
            last_focus: FocusValue::default(),
        })
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn fft_size(&self) -> (usize, usize) {
        (self.config.fft_width, self.config.fft_height)
    }

    pub fn track_depth(&self) -> usize {
        self.config.track_depth
    }

    pub fn images_tracked(&self) -> usize {
        self.images_tracked
    }

    /// True once enough history has been accumulated to correlate.
    pub fn is_ready(&self) -> bool {
        self.images_tracked > self.config.track_depth + 1
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot index of the `i`-th previous image (0 = most recent).
    fn previous_index(&self, i: usize) -> usize {
        let n = self.slot_count();
        (self.cursor + n - 1 - i) % n
    }

    pub fn current(&self) -> &SpectrumImage {
        &self.slots[self.cursor]
    }

    pub fn previous(&self, i: usize) -> &SpectrumImage {
        &self.slots[self.previous_index(i)]
    }

    /// Feed one frame and return the displacement of the image content
    /// relative to the tracking origin, in pixels.
    ///
    /// Returns zero while warming up and whenever the displacement's
    /// Manhattan length does not exceed `minimum_offset`.
    pub fn track(&mut self, frame: &Frame) -> Result<Vec2> {
        // A current image that barely moved is overwritten instead of
        // entering the history, so micro-motion is not summed up.
        let retire = !self.is_ready()
            || self.current().offset().manhattan_length() > self.config.minimum_offset;
        if retire {
            self.cursor = (self.cursor + 1) % self.slot_count();
        }

        let dc = self.slots[self.cursor].assign_and_transform(frame, &self.plan, self.dc_value)?;
        self.dc_value = Some(dc);
        self.update_focus();

        if !self.is_ready() {
            self.images_tracked += 1;
            if !self.is_ready() {
                self.slots[self.cursor].reset_offset();
                return Ok(Vec2::ZERO);
            }
        }

        let depth = self.config.track_depth;
        let mut previous_offsets = Vec::with_capacity(depth);
        let mut local_offsets = Vec::with_capacity(depth);
        for i in 0..depth {
            previous_offsets.push(self.previous(i).offset());
            local_offsets.push(self.compute_correlation_maximum(i));
        }

        let offset = fuse_displacement(
            &previous_offsets,
            &local_offsets,
            self.config.fft_width,
            self.config.fft_height,
        );
        self.slots[self.cursor].set_offset(offset);
        trace!(%offset, local = %local_offsets[0], "Correlated frame");

        if offset.manhattan_length() > self.config.minimum_offset {
            Ok(offset)
        } else {
            Ok(Vec2::ZERO)
        }
    }

    /// Shift of the current image relative to previous image `i`.
    fn compute_correlation_maximum(&mut self, i: usize) -> Vec2 {
        let prev = self.previous_index(i);
        correlation_surface_into(
            &self.slots[self.cursor],
            &self.slots[prev],
            &self.plan,
            &mut self.work,
            &mut self.surface,
        );

        let peak = spatial_maximum(&self.surface);
        let shift = unwrap_periodic(peak, self.config.fft_width, self.config.fft_height);
        if self.config.subpixel_refinement {
            shift + refine_peak_paraboloid(&self.surface, peak)
        } else {
            shift
        }
    }

    fn update_focus(&mut self) {
        if !self.brenner.enabled {
            return;
        }
        let BrennerSettings {
            offset, threshold, ..
        } = self.brenner;
        let metrics = self.slots[self.cursor].extract_focus_brenner(offset, threshold);
        self.record_focus(metrics);
    }

    fn record_focus(&mut self, metrics: FocusMetrics) {
        self.last_focus = FocusValue {
            brenner: metrics.brenner,
            focus: metrics.focus,
            avg_brenner: self.avg_brenner.push(metrics.brenner),
            avg_focus: self.avg_focus.push(metrics.focus),
            max_intensity: metrics.max_intensity,
            noise_level: metrics.noise_level,
        };
    }

    /// Raw and moving-averaged focus of the most recently tracked frame.
    pub fn last_focus(&self) -> FocusValue {
        self.last_focus
    }

    /// Focus metrics of `frame` without touching the correlation history.
    pub fn snapshot_focus(&mut self, frame: &Frame) -> FocusMetrics {
        self.snapshot.assign_z(frame);
        self.snapshot
            .extract_focus_brenner(self.brenner.offset, self.brenner.threshold)
    }

    /// Brenner value of `frame`, computed without a transform.
    pub fn compute_brenner_value_for_snapshot(&mut self, frame: &Frame) -> f64 {
        self.snapshot_focus(frame).brenner
    }

    /// Spectrum magnitude of the current image, for previews.
    pub fn spectrum_preview(&self) -> Array2<f32> {
        self.current().magnitude_image()
    }

    /// Forget all history; the next frame starts a new tracking origin.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset_offset();
        }
        self.images_tracked = 0;
        self.dc_value = None;
        self.avg_brenner.clear();
        self.avg_focus.clear();
        self.last_focus = FocusValue::default();
    }

    pub(crate) fn check_frame(&self, frame: &Frame) -> Result<()> {
        crate::spectrum::check_frame_size(frame, self.config.fft_width, self.config.fft_height)
    }
}

/// Fuse per-lag correlation results into one absolute displacement.
///
/// `previous_offsets[i]` is the stored displacement of previous image `i`
/// (0 = most recent) and `local_offsets[i]` the measured shift of the current
/// image relative to it. The estimate through image 0 seeds the consensus;
/// another lag contributes when the local shift it should have seen is small
/// enough to be measured reliably, or failing that, when the measured shift
/// agrees with the prediction.
pub fn fuse_displacement(
    previous_offsets: &[Vec2],
    local_offsets: &[Vec2],
    width: usize,
    height: usize,
) -> Vec2 {
    debug_assert_eq!(previous_offsets.len(), local_offsets.len());
    let (Some(&prev0), Some(&local0)) = (previous_offsets.first(), local_offsets.first()) else {
        return Vec2::ZERO;
    };

    let seed = prev0 + local0;
    let limit_x = CONSENSUS_PLAUSIBLE_FRACTION * width as f64;
    let limit_y = CONSENSUS_PLAUSIBLE_FRACTION * height as f64;

    let mut sum = seed;
    let mut count = 1usize;
    for (&prev, &local) in previous_offsets.iter().zip(local_offsets).skip(1) {
        let predicted = seed - prev;
        let plausible = predicted.x.abs() < limit_x && predicted.y.abs() < limit_y;

        // Relative error means nothing for tiny predictions.
        let expected = predicted.manhattan_length();
        let agrees = expected < CONSENSUS_MIN_PREDICTION_PX
            || (local - predicted).manhattan_length() / expected < CONSENSUS_RELATIVE_TOLERANCE;

        if plausible || agrees {
            sum += prev + local;
            count += 1;
        }
    }

    sum * (1.0 / count as f64)
}
