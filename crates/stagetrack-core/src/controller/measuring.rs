//! Pixel-size calibration.
//!
//! Moves the stage by a known distance along X, then along Y, and divides
//! each distance by the image displacement it caused.

use tracing::{debug, info};

use crate::config::TunerConfig;
use crate::events::AbortReason;
use crate::frame::Vec2;

use super::{Mode, TunerStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeasuringState {
    MakeFirstMove,
    WaitingForFirstMove,
    WaitingForSecondMove,
    Done,
}

/// Stage axis a calibration move runs along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationAxis {
    X,
    Y,
}

impl std::fmt::Display for CalibrationAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X => write!(f, "X"),
            Self::Y => write!(f, "Y"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Measuring {
    config: TunerConfig,
    state: MeasuringState,
    /// Image displacement expected for one step, from the configured pixel size.
    expected_px: Vec2,
    baseline: Vec2,
    move_time_us: u64,
    detected_at_us: Option<u64>,
    pixel_size_x: Option<f64>,
    result: Option<Vec2>,
}

impl Measuring {
    pub fn new(config: TunerConfig, pixel_size: Vec2) -> Self {
        let expected_px = Vec2::new(
            config.step_um / pixel_size.x.abs(),
            config.step_um / pixel_size.y.abs(),
        );
        Self {
            config,
            state: MeasuringState::MakeFirstMove,
            expected_px,
            baseline: Vec2::ZERO,
            move_time_us: 0,
            detected_at_us: None,
            pixel_size_x: None,
            result: None,
        }
    }

    pub fn state(&self) -> MeasuringState {
        self.state
    }

    /// Measured pixel size, available once the run finished.
    pub fn result(&self) -> Option<Vec2> {
        self.result
    }

    /// Advance the state machine with the current image offset.
    pub fn step(&mut self, offset: Vec2, now_us: u64) -> Result<TunerStep, AbortReason> {
        let step = self.config.step_um;
        match self.state {
            MeasuringState::MakeFirstMove => {
                self.begin_move(offset, now_us);
                self.state = MeasuringState::WaitingForFirstMove;
                Ok(TunerStep::move_by(Vec2::new(step, 0.0)))
            }
            MeasuringState::WaitingForFirstMove => {
                let Some(delta) = self.settled_delta(offset, now_us, self.expected_px.x)? else {
                    return Ok(TunerStep::idle());
                };
                let px = self.checked_pixel_size(CalibrationAxis::X, step, delta.x)?;
                debug!(delta = %delta, pixel_size_x = px, "First calibration move measured");
                self.pixel_size_x = Some(px);
                self.begin_move(offset, now_us);
                self.state = MeasuringState::WaitingForSecondMove;
                Ok(TunerStep::move_by(Vec2::new(0.0, step)))
            }
            MeasuringState::WaitingForSecondMove => {
                let Some(delta) = self.settled_delta(offset, now_us, self.expected_px.y)? else {
                    return Ok(TunerStep::idle());
                };
                let py = self.checked_pixel_size(CalibrationAxis::Y, step, delta.y)?;
                let px = self.pixel_size_x.unwrap_or(f64::NAN);
                let pixel_size = Vec2::new(px, py);
                info!(%pixel_size, "Pixel size measured");
                self.result = Some(pixel_size);
                self.state = MeasuringState::Done;
                Ok(TunerStep::finish(Vec2::new(-step, -step)))
            }
            MeasuringState::Done => Ok(TunerStep::finish(Vec2::ZERO)),
        }
    }

    /// The last requested move reached the stage only now; measure from here.
    pub fn move_issued(&mut self, offset: Vec2, now_us: u64) {
        self.begin_move(offset, now_us);
    }

    fn begin_move(&mut self, offset: Vec2, now_us: u64) {
        self.baseline = offset;
        self.move_time_us = now_us;
        self.detected_at_us = None;
    }

    /// Offset change since the move once motion was detected and had time to
    /// settle; `None` while still waiting.
    fn settled_delta(
        &mut self,
        offset: Vec2,
        now_us: u64,
        expected: f64,
    ) -> Result<Option<Vec2>, AbortReason> {
        let delta = offset - self.baseline;
        match self.detected_at_us {
            None => {
                if delta.manhattan_length() >= self.config.detect_fraction * expected {
                    self.detected_at_us = Some(now_us);
                } else if now_us.saturating_sub(self.move_time_us) > self.config.timeout_us {
                    return Err(AbortReason::MeasurementTimeout {
                        mode: Mode::Measuring,
                    });
                }
                Ok(None)
            }
            Some(t) if now_us.saturating_sub(t) >= self.config.settle_us => Ok(Some(delta)),
            Some(_) => Ok(None),
        }
    }

    fn checked_pixel_size(
        &self,
        axis: CalibrationAxis,
        step: f64,
        delta_px: f64,
    ) -> Result<f64, AbortReason> {
        let px = step / delta_px;
        let magnitude = px.abs();
        if !px.is_finite()
            || magnitude < self.config.min_pixel_size_um
            || magnitude > self.config.max_pixel_size_um
        {
            return Err(AbortReason::ImplausiblePixelSize {
                axis,
                pixel_size: px,
            });
        }
        Ok(px)
    }
}
