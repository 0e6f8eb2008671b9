use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};
use crate::frame::Vec2;

/// Complete tracking configuration. Every section falls back to its
/// defaults when missing from a TOML file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub stage: StageConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub zstack: ZStackConfig,
}

impl TrackingConfig {
    /// Check every section; the first violation is reported.
    pub fn validate(&self) -> Result<()> {
        self.correlator.validate()?;
        self.focus.validate()?;
        self.stage.validate()?;
        self.control.validate()?;
        self.tuner.validate()?;
        self.zstack.validate()
    }
}

fn invalid(msg: impl Into<String>) -> TrackError {
    TrackError::InvalidConfig(msg.into())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// FFT computation width in pixels (must not exceed the frame width).
    pub fft_width: usize,
    /// FFT computation height in pixels (must not exceed the frame height).
    pub fft_height: usize,
    /// Number of previous frames compared against the newest one.
    pub track_depth: usize,
    /// Offsets with a Manhattan length at or below this (pixels) are
    /// reported as zero.
    pub minimum_offset: f64,
    /// Refine correlation peaks with a 3x3 paraboloid fit.
    pub subpixel_refinement: bool,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            fft_width: 256,
            fft_height: 256,
            track_depth: 4,
            minimum_offset: 0.5,
            subpixel_refinement: false,
        }
    }
}

impl CorrelatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_width < 2 || self.fft_height < 2 {
            return Err(invalid(format!(
                "FFT size {}x{} is too small",
                self.fft_width, self.fft_height
            )));
        }
        if self.track_depth == 0 {
            return Err(invalid("track depth must be at least 1"));
        }
        if !(self.minimum_offset >= 0.0) {
            return Err(invalid("minimum offset must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Compute Brenner values while tracking; when off the controller emits
    /// spectrum previews instead.
    pub brenner_enabled: bool,
    /// Centered ROI as a percentage (0, 100] of each frame dimension.
    pub roi_percentage: f64,
    /// Neighbor distance `n` of the Brenner gradient.
    pub brenner_offset: usize,
    /// Squared differences at or below this are ignored (8-bit scale).
    pub brenner_threshold: f64,
    /// Upper satisfaction threshold as a fraction of the Z-stack maximum.
    pub upper_threshold: f64,
    /// Lower satisfaction threshold as a fraction of the Z-stack maximum.
    pub lower_threshold: f64,
    /// Z step (µm) taken when far away from focus.
    pub large_correction_step: f64,
    /// Focus curve width (µm) used when the estimate is disabled.
    pub full_window_size: f64,
    /// Derive window size and large step from the Z-stack fit.
    pub use_estimated_window: bool,
    /// Use the noise level interpolated at the current Brenner value instead
    /// of the Z-stack mean noise.
    pub use_noise_level_at_brenner: bool,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            brenner_enabled: true,
            roi_percentage: 50.0,
            brenner_offset: 2,
            brenner_threshold: 0.0,
            upper_threshold: 0.9,
            lower_threshold: 0.5,
            large_correction_step: 2.0,
            full_window_size: 10.0,
            use_estimated_window: true,
            use_noise_level_at_brenner: true,
        }
    }
}

impl FocusConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.roi_percentage > 0.0 && self.roi_percentage <= 100.0) {
            return Err(invalid(format!(
                "ROI percentage {} outside (0, 100]",
                self.roi_percentage
            )));
        }
        if self.brenner_offset == 0 {
            return Err(invalid("Brenner offset must be at least 1"));
        }
        if !(self.lower_threshold > 0.0
            && self.lower_threshold < self.upper_threshold
            && self.upper_threshold <= 1.0)
        {
            return Err(invalid(format!(
                "focus thresholds must satisfy 0 < lower ({}) < upper ({}) <= 1",
                self.lower_threshold, self.upper_threshold
            )));
        }
        if !(self.large_correction_step > 0.0) || !(self.full_window_size > 0.0) {
            return Err(invalid("focus step sizes must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// µm per pixel along X (sign encodes axis orientation).
    pub pixel_size_x: f64,
    /// µm per pixel along Y.
    pub pixel_size_y: f64,
    /// Delay after frame capture before a stage command is issued (µs).
    pub command_delay_us: u64,
    /// Largest total displacement (µm) per axis allowed in one run.
    pub max_total_move: f64,
    pub xy_blocking: bool,
    pub z_blocking: bool,
    /// Proportional gain applied to Z corrections.
    pub prop_gain_z: f64,
    /// Linear settle-time model for Z moves (µs per µm).
    pub z_settle_gain_us_per_um: f64,
    /// XY moves below this many pixels on both axes are not issued.
    pub move_deadband_px: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            pixel_size_x: 0.5,
            pixel_size_y: 0.5,
            command_delay_us: 0,
            max_total_move: 1000.0,
            xy_blocking: false,
            z_blocking: false,
            prop_gain_z: 1.0,
            z_settle_gain_us_per_um: 20_000.0,
            move_deadband_px: 0.5,
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pixel_size_x == 0.0 || self.pixel_size_y == 0.0 {
            return Err(invalid("pixel size must be non-zero on both axes"));
        }
        if !self.pixel_size_x.is_finite() || !self.pixel_size_y.is_finite() {
            return Err(invalid("pixel size must be finite"));
        }
        if !(self.max_total_move > 0.0) {
            return Err(invalid("max total stage move must be positive"));
        }
        if !(self.prop_gain_z > 0.0) {
            return Err(invalid("Z proportional gain must be positive"));
        }
        Ok(())
    }

    pub fn pixel_size(&self) -> Vec2 {
        Vec2::new(self.pixel_size_x, self.pixel_size_y)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub track_xy: bool,
    pub track_z: bool,
    /// Number of frames a stage command stays invisible in the image.
    pub predictor_size: usize,
    /// Proportional gain of the XY transfer function, kept below 1.
    pub controller_gain: f64,
    /// Frames older than this when processing starts are dropped (µs).
    pub max_process_delay_us: u64,
    pub exposure_time_us: u64,
    /// Emit a Brenner/position log event for every frame.
    pub continuous_log: bool,
    /// Re-arm the autofocus capture this long after it fired (µs).
    pub autofocus_capture_interval_us: Option<u64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            track_xy: true,
            track_z: false,
            predictor_size: 2,
            controller_gain: 0.6,
            max_process_delay_us: 50_000,
            exposure_time_us: 10_000,
            continuous_log: true,
            autofocus_capture_interval_us: None,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.controller_gain > 0.0 && self.controller_gain.is_finite()) {
            return Err(invalid("controller gain must be positive"));
        }
        if self.controller_gain >= 1.0 {
            tracing::warn!(
                gain = self.controller_gain,
                "Controller gain >= 1, the loop may oscillate"
            );
        }
        Ok(())
    }
}

/// Settings shared by the Measuring and Timing modes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Size of the calibration moves (µm).
    pub step_um: f64,
    /// Abort when no motion is seen for this long after a move (µs).
    pub timeout_us: u64,
    /// Wait before measuring a settled offset (µs).
    pub settle_us: u64,
    /// Fraction of the expected step that counts as detected motion.
    pub detect_fraction: f64,
    /// Number of moves measured in Timing mode.
    pub repetitions: usize,
    pub min_pixel_size_um: f64,
    pub max_pixel_size_um: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            step_um: 10.0,
            timeout_us: 5_000_000,
            settle_us: 300_000,
            detect_fraction: 0.5,
            repetitions: 4,
            min_pixel_size_um: 0.01,
            max_pixel_size_um: 100.0,
        }
    }
}

impl TunerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_um > 0.0) {
            return Err(invalid("tuner step must be positive"));
        }
        if !(self.detect_fraction > 0.0 && self.detect_fraction <= 1.0) {
            return Err(invalid("tuner detect fraction outside (0, 1]"));
        }
        if self.repetitions == 0 {
            return Err(invalid("tuner repetitions must be at least 1"));
        }
        if !(self.min_pixel_size_um > 0.0 && self.min_pixel_size_um < self.max_pixel_size_um) {
            return Err(invalid("plausible pixel size range is empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZStackConfig {
    /// Total Z range (µm), centered on the current position.
    pub range_um: f64,
    /// Distance between slices (µm).
    pub step_um: f64,
    /// Frames averaged per slice.
    pub frames_per_step: usize,
}

impl Default for ZStackConfig {
    fn default() -> Self {
        Self {
            range_um: 20.0,
            step_um: 1.0,
            frames_per_step: 3,
        }
    }
}

impl ZStackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_um > 0.0) || self.range_um < self.step_um * 2.0 {
            return Err(invalid(format!(
                "Z-stack needs at least three slices (range {} µm, step {} µm)",
                self.range_um, self.step_um
            )));
        }
        if self.frames_per_step == 0 {
            return Err(invalid("Z-stack frames per step must be at least 1"));
        }
        Ok(())
    }

    pub fn slice_count(&self) -> usize {
        (self.range_um / self.step_um).floor() as usize + 1
    }
}
