/// Minimum pixel count (h*w) to use row-level Rayon parallelism in the FFT.
pub const PARALLEL_PIXEL_THRESHOLD: usize = 65_536;

/// Small epsilon to avoid division by zero in floating-point comparisons.
pub const EPSILON: f64 = 1e-12;

/// Number of samples in the focus moving-average register.
pub const FOCUS_AVERAGE_LEN: usize = 6;

/// Capacity of the controller's Z focus history.
pub const FOCUS_HISTORY_LEN: usize = 10;

/// Number of most recent samples that must all be in focus before an
/// autofocus-triggered capture fires.
pub const IN_FOCUS_CONFIRMATIONS: usize = 3;

/// A previous image takes part in the consensus when its predicted local
/// offset is below this fraction of the image size on both axes.
pub const CONSENSUS_PLAUSIBLE_FRACTION: f64 = 0.13;

/// A contribution with an implausibly large prediction is still accepted when
/// the measured local offset is within this relative (Manhattan) error.
pub const CONSENSUS_RELATIVE_TOLERANCE: f64 = 0.10;

/// Below this predicted Manhattan length (pixels) the relative error is
/// meaningless and the contribution is accepted.
pub const CONSENSUS_MIN_PREDICTION_PX: f64 = 2.0;

/// Weight of the newest frame mean in the running DC estimate.
pub const DC_SMOOTHING: f64 = 0.1;

/// Stage moves are clamped to this fraction of the image extent per axis.
pub const SATURATION_FRACTION: f64 = 0.25;

/// Z corrections smaller than this (µm) are not issued.
pub const Z_DEADBAND_UM: f64 = 0.01;

/// Empirical scale applied to the linear Z settle-time model.
pub const Z_SETTLE_FACTOR: f64 = 1.5;

/// MAD to standard deviation for a normal distribution.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Interval over which the frame rate is reported (µs).
pub const FRAME_RATE_INTERVAL_US: u64 = 1_000_000;
