//! Stage latency measurement.
//!
//! Alternates small X moves and records how long it takes until each move
//! shows up in the image. The frame count of that delay is the Smith
//! predictor size the loop needs.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TunerConfig;
use crate::events::AbortReason;
use crate::frame::Vec2;

use super::{Mode, TunerStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingState {
    WaitingOnStartup,
    WaitingForMove,
    WaitingForMoveEnd,
    Done,
}

/// Outcome of a Timing run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    /// Mean time from command to first visible motion (µs).
    pub mean_latency_us: f64,
    /// Mean number of frames processed before motion became visible.
    pub mean_latency_frames: f64,
    pub suggested_predictor_size: usize,
    pub samples: usize,
}

#[derive(Clone, Debug)]
pub struct Timing {
    config: TunerConfig,
    state: TimingState,
    expected_px: f64,
    started_at_us: Option<u64>,
    move_time_us: u64,
    detected_at_us: u64,
    baseline: Vec2,
    direction: f64,
    displacement: f64,
    frames_since_move: usize,
    latencies_us: Vec<u64>,
    latency_frames: Vec<usize>,
    report: Option<TimingReport>,
}

impl Timing {
    pub fn new(config: TunerConfig, pixel_size: Vec2) -> Self {
        Self {
            expected_px: config.step_um / pixel_size.x.abs(),
            latencies_us: Vec::with_capacity(config.repetitions),
            latency_frames: Vec::with_capacity(config.repetitions),
            config,
            state: TimingState::WaitingOnStartup,
            started_at_us: None,
            move_time_us: 0,
            detected_at_us: 0,
            baseline: Vec2::ZERO,
            direction: 1.0,
            displacement: 0.0,
            frames_since_move: 0,
            report: None,
        }
    }

    pub fn state(&self) -> TimingState {
        self.state
    }

    pub fn report(&self) -> Option<TimingReport> {
        self.report
    }

    pub fn step(
        &mut self,
        offset: Vec2,
        capture_time_us: u64,
        now_us: u64,
    ) -> Result<TunerStep, AbortReason> {
        match self.state {
            TimingState::WaitingOnStartup => {
                let started = *self.started_at_us.get_or_insert(now_us);
                if now_us.saturating_sub(started) < self.config.settle_us {
                    return Ok(TunerStep::idle());
                }
                Ok(self.issue_move(offset, now_us))
            }
            TimingState::WaitingForMove => {
                self.frames_since_move += 1;
                let delta = offset - self.baseline;
                if delta.x.abs() >= self.config.detect_fraction * self.expected_px {
                    let latency = capture_time_us.saturating_sub(self.move_time_us);
                    debug!(
                        latency_us = latency,
                        frames = self.frames_since_move,
                        "Stage motion detected"
                    );
                    self.latencies_us.push(latency);
                    self.latency_frames.push(self.frames_since_move);
                    self.detected_at_us = now_us;
                    self.state = TimingState::WaitingForMoveEnd;
                } else if now_us.saturating_sub(self.move_time_us) > self.config.timeout_us {
                    return Err(AbortReason::MeasurementTimeout { mode: Mode::Timing });
                }
                Ok(TunerStep::idle())
            }
            TimingState::WaitingForMoveEnd => {
                if now_us.saturating_sub(self.detected_at_us) < self.config.settle_us {
                    return Ok(TunerStep::idle());
                }
                if self.latencies_us.len() >= self.config.repetitions {
                    self.report = Some(self.build_report());
                    self.state = TimingState::Done;
                    return Ok(TunerStep::finish(Vec2::new(-self.displacement, 0.0)));
                }
                self.direction = -self.direction;
                Ok(self.issue_move(offset, now_us))
            }
            TimingState::Done => Ok(TunerStep::finish(Vec2::ZERO)),
        }
    }

    /// The last requested move reached the stage only now; measure from here.
    pub fn move_issued(&mut self, offset: Vec2, now_us: u64) {
        self.baseline = offset;
        self.move_time_us = now_us;
        self.frames_since_move = 0;
    }

    fn issue_move(&mut self, offset: Vec2, now_us: u64) -> TunerStep {
        let dx = self.direction * self.config.step_um;
        self.displacement += dx;
        self.baseline = offset;
        self.move_time_us = now_us;
        self.frames_since_move = 0;
        self.state = TimingState::WaitingForMove;
        TunerStep::move_by(Vec2::new(dx, 0.0))
    }

    fn build_report(&self) -> TimingReport {
        let n = self.latencies_us.len().max(1) as f64;
        let mean_latency_us = self.latencies_us.iter().sum::<u64>() as f64 / n;
        let mean_latency_frames = self.latency_frames.iter().sum::<usize>() as f64 / n;
        let report = TimingReport {
            mean_latency_us,
            mean_latency_frames,
            suggested_predictor_size: mean_latency_frames.ceil() as usize,
            samples: self.latencies_us.len(),
        };
        info!(?report, "Stage timing measured");
        report
    }
}
