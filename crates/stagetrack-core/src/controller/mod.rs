//! Closed-loop stage controller.
//!
//! The [`Controller`] turns frames into stage commands. It owns the
//! correlator, the focus tracker and the Smith predictor, and drives the
//! mode-specific state machines. It is single-threaded by construction;
//! [`ControlLoop`] runs it on a dedicated worker fed through a channel.

mod measuring;
mod mode;
mod predictor;
mod rebuild;
mod timing;
mod worker;
mod ztrack;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

pub use measuring::{CalibrationAxis, Measuring, MeasuringState};
pub use mode::Mode;
pub use predictor::SmithPredictor;
pub use rebuild::CorrelatorRebuilder;
pub use timing::{Timing, TimingReport, TimingState};
pub use worker::{ControlLoop, LoopCommand, LoopHandle};
pub use ztrack::{ZDecision, ZTracker};

use crate::clock::Clock;
use crate::config::TrackingConfig;
use crate::consts::{FRAME_RATE_INTERVAL_US, SATURATION_FRACTION, Z_DEADBAND_UM, Z_SETTLE_FACTOR};
use crate::correlator::Correlator;
use crate::error::{Result, TrackError};
use crate::events::{AbortReason, ControllerEvent, EventSink};
use crate::focus_tracker::{FocusTracker, ZStackStatus};
use crate::frame::{Axis, Frame, Vec2};
use crate::stage::Stage;

/// Stage move requested by a calibration state machine for one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TunerStep {
    /// Relative stage move in µm; zero when nothing should move.
    pub stage_move: Vec2,
    /// The run is complete once this move has been issued.
    pub finished: bool,
}

impl TunerStep {
    pub(crate) fn idle() -> Self {
        Self {
            stage_move: Vec2::ZERO,
            finished: false,
        }
    }

    pub(crate) fn move_by(stage_move: Vec2) -> Self {
        Self {
            stage_move,
            finished: false,
        }
    }

    pub(crate) fn finish(stage_move: Vec2) -> Self {
        Self {
            stage_move,
            finished: true,
        }
    }
}

/// Frames per second over capture time, reported once per interval.
#[derive(Clone, Copy, Debug, Default)]
struct FrameRateCounter {
    window_start_us: Option<u64>,
    frames: u32,
}

impl FrameRateCounter {
    fn tick(&mut self, capture_time_us: u64) -> Option<f64> {
        let start = *self.window_start_us.get_or_insert(capture_time_us);
        self.frames += 1;
        let elapsed = capture_time_us.saturating_sub(start);
        if elapsed < FRAME_RATE_INTERVAL_US {
            return None;
        }
        let fps = f64::from(self.frames - 1) * 1e6 / elapsed as f64;
        self.window_start_us = Some(capture_time_us);
        self.frames = 1;
        Some(fps)
    }
}

pub struct Controller {
    config: TrackingConfig,
    mode: Mode,
    running: bool,
    clock: Arc<dyn Clock>,
    events: Box<dyn EventSink>,
    stage: Option<Box<dyn Stage>>,
    correlator: Option<Correlator>,
    rebuilder: Option<CorrelatorRebuilder>,
    focus_tracker: FocusTracker,
    predictor: SmithPredictor,
    /// Stage travel issued since the run started (µm).
    total_move: Vec2,
    z: ZTracker,
    measuring: Option<Measuring>,
    timing: Option<Timing>,
    timing_report: Option<TimingReport>,
    /// Tuner step held back while the XY stage was busy.
    deferred_step: Option<(Vec2, bool)>,
    frame_rate: FrameRateCounter,
}

impl Controller {
    /// Build a controller with a correlator for `config`.
    ///
    /// The correlator is planned on the calling thread; use
    /// [`Controller::request_rebuild`] to re-plan in the background later.
    pub fn new(
        config: TrackingConfig,
        clock: Arc<dyn Clock>,
        events: Box<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let correlator = Correlator::new(&config.correlator, &config.focus)?;
        let focus_tracker = FocusTracker::new(
            config.focus.clone(),
            config.zstack.clone(),
            config.stage.z_blocking,
        );

        Ok(Self {
            predictor: SmithPredictor::new(config.control.predictor_size),
            config,
            mode: Mode::Tracking,
            running: false,
            clock,
            events,
            stage: None,
            correlator: Some(correlator),
            rebuilder: None,
            focus_tracker,
            total_move: Vec2::ZERO,
            z: ZTracker::default(),
            measuring: None,
            timing: None,
            timing_report: None,
            deferred_step: None,
            frame_rate: FrameRateCounter::default(),
        })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn predictor(&self) -> &SmithPredictor {
        &self.predictor
    }

    /// Moves still in flight. `run()` starts every run with an empty queue.
    pub fn predictor_mut(&mut self) -> &mut SmithPredictor {
        &mut self.predictor
    }

    pub fn total_move(&self) -> Vec2 {
        self.total_move
    }

    pub fn correlator(&self) -> Option<&Correlator> {
        self.correlator.as_ref()
    }

    pub fn focus_tracker(&self) -> &FocusTracker {
        &self.focus_tracker
    }

    pub fn focus_tracker_mut(&mut self) -> &mut FocusTracker {
        &mut self.focus_tracker
    }

    pub fn z_tracker(&self) -> &ZTracker {
        &self.z
    }

    pub fn stage(&self) -> Option<&dyn Stage> {
        self.stage.as_deref()
    }

    /// Pixel size measured by the last Measuring run, if any.
    pub fn measured_pixel_size(&self) -> Option<Vec2> {
        self.measuring.as_ref().and_then(Measuring::result)
    }

    pub fn timing_report(&self) -> Option<TimingReport> {
        self.timing_report
    }

    pub fn set_stage(&mut self, stage: Box<dyn Stage>) -> Result<()> {
        if self.running {
            return Err(TrackError::ModeLocked);
        }
        self.stage = Some(stage);
        Ok(())
    }

    pub fn take_stage(&mut self) -> Option<Box<dyn Stage>> {
        if self.running {
            return None;
        }
        self.stage.take()
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if self.running {
            return Err(TrackError::ModeLocked);
        }
        self.mode = mode;
        Ok(())
    }

    /// Replace the configuration. A changed FFT size, track depth or
    /// Brenner setup schedules a correlator rebuild.
    pub fn set_config(&mut self, config: TrackingConfig) -> Result<()> {
        if self.running {
            return Err(TrackError::ModeLocked);
        }
        config.validate()?;

        let needs_rebuild = config.correlator != self.config.correlator
            || config.focus.brenner_enabled != self.config.focus.brenner_enabled
            || config.focus.roi_percentage != self.config.focus.roi_percentage
            || config.focus.brenner_offset != self.config.focus.brenner_offset
            || config.focus.brenner_threshold != self.config.focus.brenner_threshold;

        self.focus_tracker.configure(
            config.focus.clone(),
            config.zstack.clone(),
            config.stage.z_blocking,
        );
        self.predictor.resize(config.control.predictor_size);
        self.config = config;

        if needs_rebuild {
            self.request_rebuild()?;
        }
        Ok(())
    }

    /// Resize the Smith predictor; allowed while running.
    pub fn set_predictor_size(&mut self, size: usize) {
        self.config.control.predictor_size = size;
        self.predictor.resize(size);
        debug!(size, "Predictor resized");
    }

    /// Install a correlator directly, cancelling any pending rebuild.
    pub fn set_correlator(&mut self, correlator: Correlator) -> Result<()> {
        if self.running {
            return Err(TrackError::ModeLocked);
        }
        if let Some(rebuilder) = self.rebuilder.as_mut() {
            rebuilder.cancel();
        }
        self.correlator = Some(correlator);
        Ok(())
    }

    /// Plan a new correlator for the current configuration in the
    /// background. Returns the request's generation number.
    pub fn request_rebuild(&mut self) -> Result<u64> {
        if self.running {
            return Err(TrackError::ModeLocked);
        }
        let rebuilder = match self.rebuilder.take() {
            Some(r) => r,
            None => CorrelatorRebuilder::spawn()?,
        };
        self.rebuilder
            .insert(rebuilder)
            .request(&self.config.correlator, &self.config.focus)
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuilder.as_ref().is_some_and(CorrelatorRebuilder::is_pending)
    }

    /// Install a finished rebuild. `Ok(true)` when a new correlator was
    /// installed; a failed build is returned as the error.
    pub fn poll_rebuild(&mut self) -> Result<bool> {
        let Some(result) = self.rebuilder.as_mut().and_then(CorrelatorRebuilder::poll) else {
            return Ok(false);
        };
        self.install_rebuilt(result)
    }

    /// Like [`Controller::poll_rebuild`] but blocks up to `timeout`.
    pub fn wait_for_rebuild(&mut self, timeout: Duration) -> Result<bool> {
        let Some(result) = self.rebuilder.as_mut().and_then(|r| r.wait(timeout)) else {
            return Ok(false);
        };
        self.install_rebuilt(result)
    }

    fn install_rebuilt(&mut self, result: Result<Correlator>) -> Result<bool> {
        let correlator = result?;
        let (w, h) = correlator.fft_size();
        info!(width = w, height = h, "Correlator rebuilt");
        self.correlator = Some(correlator);
        Ok(true)
    }

    /// Start a run in the current mode.
    pub fn run(&mut self) -> Result<()> {
        if self.running {
            return Err(TrackError::AlreadyRunning);
        }
        self.poll_rebuild()?;
        if self.rebuild_pending() {
            return Err(TrackError::RebuildPending);
        }
        let Some(stage) = self.stage.as_deref_mut() else {
            return Err(TrackError::NoStage);
        };
        let Some(correlator) = self.correlator.as_mut() else {
            return Err(TrackError::CorrelatorUnavailable);
        };
        if self.mode == Mode::Tracking
            && self.config.control.track_z
            && !self.focus_tracker.is_ready()
        {
            return Err(TrackError::FocusModelMissing);
        }

        let now = self.clock.now_us();
        correlator.reset();
        self.predictor = SmithPredictor::new(self.config.control.predictor_size);
        self.total_move = Vec2::ZERO;
        self.z.reset();
        self.frame_rate = FrameRateCounter::default();
        self.measuring = None;
        self.timing = None;
        self.deferred_step = None;

        match self.mode {
            Mode::Tracking => {}
            Mode::Measuring => {
                self.measuring = Some(Measuring::new(
                    self.config.tuner.clone(),
                    self.config.stage.pixel_size(),
                ));
            }
            Mode::Timing => {
                self.timing_report = None;
                self.timing = Some(Timing::new(
                    self.config.tuner.clone(),
                    self.config.stage.pixel_size(),
                ));
            }
            Mode::ZStack => self.focus_tracker.start_acquisition(stage, now)?,
        }

        self.running = true;
        info!(mode = %self.mode, "Run started");
        self.events.emit(ControllerEvent::Started { mode: self.mode });
        Ok(())
    }

    /// Stop the run on request.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(stage) = self.stage.as_deref_mut() {
            self.focus_tracker.cancel_acquisition(stage);
        }
        self.finish_run();
    }

    fn finish_run(&mut self) {
        self.running = false;
        info!(mode = %self.mode, "Run stopped");
        self.events.emit(ControllerEvent::Stopped { mode: self.mode });
    }

    /// Abort the run: halt the stage and report why.
    fn stop_intern(&mut self, reason: AbortReason) {
        warn!(mode = %self.mode, %reason, "Run aborted");
        self.running = false;
        if let Some(stage) = self.stage.as_deref_mut() {
            self.focus_tracker.cancel_acquisition(stage);
            stage.stop_all();
        }
        self.events.emit(ControllerEvent::Aborted {
            mode: self.mode,
            reason,
        });
    }

    /// Acknowledge that a non-blocking move finished.
    pub fn motion_complete(&mut self, axis: Axis) {
        match axis {
            Axis::Z => {
                let ready_at = self.clock.now_us() + self.config.control.exposure_time_us;
                if ready_at < self.z.next_allowed_us() {
                    self.z.set_next_allowed_us(ready_at);
                }
                trace!(ready_at, "Z motion complete");
            }
            Axis::XY => trace!("XY motion complete"),
        }
    }

    /// Fire an autofocus capture the next time focus is confirmed.
    pub fn arm_autofocus_capture(&mut self) {
        self.z.arm_capture(self.clock.now_us());
    }

    /// Process one frame. Does nothing unless a run is active.
    pub fn track_image(&mut self, frame: &Frame) {
        if !self.running {
            return;
        }
        let now = self.clock.now_us();

        if self.config.control.continuous_log {
            self.log_continuous(frame);
        }

        if now > frame.process_time_us + self.config.control.max_process_delay_us {
            trace!(
                late_us = now - frame.process_time_us,
                "Dropping stale frame"
            );
            self.predictor.advance(Vec2::ZERO);
            return;
        }

        if self.mode == Mode::ZStack {
            self.track_zstack(frame, now);
            return;
        }

        let size_check = self
            .correlator
            .as_ref()
            .map_or(Ok(()), |c| c.check_frame(frame));
        if let Err(e) = size_check {
            self.stop_intern(e.into());
            return;
        }

        if self.mode == Mode::Tracking && self.config.control.track_z {
            self.track_z(frame, now);
            if !self.running {
                return;
            }
        }

        if self.config.control.track_xy || self.mode != Mode::Tracking {
            self.track_xy(frame);
        }

        if let Some(fps) = self.frame_rate.tick(frame.capture_time_us) {
            self.events.emit(ControllerEvent::FrameRate { fps });
            if let Some(stage) = self.stage.as_deref() {
                self.events.emit(ControllerEvent::StagePosition(stage.position()));
            }
        }
    }

    fn log_continuous(&mut self, frame: &Frame) {
        let (Some(correlator), Some(stage)) = (self.correlator.as_mut(), self.stage.as_deref())
        else {
            return;
        };
        let brenner = correlator.compute_brenner_value_for_snapshot(frame);
        self.events.emit(ControllerEvent::ContinuousLog {
            capture_time_us: frame.capture_time_us,
            brenner,
            position: stage.position(),
        });
    }

    fn track_zstack(&mut self, frame: &Frame, now: u64) {
        let (Some(correlator), Some(stage)) = (self.correlator.as_mut(), self.stage.as_deref_mut())
        else {
            unreachable!("run() requires a stage and a correlator");
        };
        let brenner = correlator.compute_brenner_value_for_snapshot(frame);
        let done_before = self.focus_tracker.progress().map(|p| p.0);

        match self
            .focus_tracker
            .process_zstack_frame(brenner, frame.capture_time_us, now, stage)
        {
            Ok(ZStackStatus::InProgress) => {
                if let Some((done, total)) = self.focus_tracker.progress() {
                    if Some(done) != done_before {
                        self.events.emit(ControllerEvent::ZStackProgress { done, total });
                    }
                }
            }
            Ok(ZStackStatus::Complete) => {
                if let Some(model) = self.focus_tracker.model() {
                    self.events.emit(ControllerEvent::ZStackAcquired {
                        samples: model.samples().len(),
                        best_z: model.best_z(),
                    });
                }
                self.finish_run();
            }
            Err(e) => self.stop_intern(e.into()),
        }
    }

    /// Z autofocus on one frame.
    fn track_z(&mut self, frame: &Frame, now: u64) {
        let (Some(correlator), Some(stage)) = (self.correlator.as_mut(), self.stage.as_deref_mut())
        else {
            unreachable!("run() requires a stage and a correlator");
        };
        if stage.is_moving_z() {
            trace!("Z still moving");
            return;
        }
        if frame.capture_time_us < self.z.next_allowed_us() {
            trace!(
                capture = frame.capture_time_us,
                allowed = self.z.next_allowed_us(),
                "Frame too close to last Z move"
            );
            return;
        }

        let brenner = correlator.compute_brenner_value_for_snapshot(frame);
        self.z.push(brenner);

        match self.z.decide(&self.focus_tracker) {
            ZDecision::Wait => {}
            ZDecision::InFocus { confirmed } => {
                trace!(brenner, confirmed, "In focus");
                if confirmed && self.z.capture_armed(now) {
                    self.events.emit(ControllerEvent::AutofocusCapture {
                        capture_time_us: frame.capture_time_us,
                        brenner,
                    });
                    match self.config.control.autofocus_capture_interval_us {
                        Some(interval) => self.z.arm_capture(now + interval),
                        None => self.z.disarm_capture(),
                    }
                }
            }
            ZDecision::Move {
                distance,
                direction,
            } => {
                if distance <= Z_DEADBAND_UM {
                    return;
                }
                let stage_cfg = &self.config.stage;
                let settle_us = distance * stage_cfg.z_settle_gain_us_per_um * Z_SETTLE_FACTOR;
                self.z
                    .set_next_allowed_us(now + settle_us as u64 + self.config.control.exposure_time_us);

                let dz = direction * distance * stage_cfg.prop_gain_z;
                debug!(brenner, dz, "Z correction");
                if !stage.move_z(dz, stage_cfg.z_blocking) {
                    self.stop_intern(AbortReason::StageRejected);
                    return;
                }
                self.events.emit(ControllerEvent::ZMoved {
                    distance: dz,
                    brenner,
                });
            }
        }
    }

    /// XY correlation and stage command for one frame.
    fn track_xy(&mut self, frame: &Frame) {
        let Some(correlator) = self.correlator.as_mut() else {
            unreachable!("run() requires a correlator");
        };
        let offset = match correlator.track(frame) {
            Ok(offset) => offset,
            Err(e) => {
                self.stop_intern(e.into());
                return;
            }
        };
        if self.config.focus.brenner_enabled {
            self.events.emit(ControllerEvent::Focus(correlator.last_focus()));
        } else {
            self.events
                .emit(ControllerEvent::SpectrumPreview(correlator.spectrum_preview()));
        }
        let ready = correlator.is_ready();

        let now = self.clock.now_us();
        let deferred = if ready { self.deferred_step.take() } else { None };
        let resumed = deferred.is_some();
        let (requested, finished) = if !ready {
            (Vec2::ZERO, false)
        } else if let Some(step) = deferred {
            step
        } else {
            match self.mode_function(offset, frame.capture_time_us, now) {
                Ok(step) => step,
                Err(reason) => {
                    self.stop_intern(reason);
                    return;
                }
            }
        };

        let stage_move = self.saturate(requested, frame);
        let Some(stage) = self.stage.as_deref_mut() else {
            unreachable!("run() requires a stage");
        };

        let px = self.config.stage.pixel_size();
        let deadband = self.config.stage.move_deadband_px;
        if stage_move.x.abs() < deadband * px.x.abs()
            && stage_move.y.abs() < deadband * px.y.abs()
            && !stage.is_moving_xy()
        {
            // The predictor is not advanced on this path.
            trace!(%stage_move, "Move below deadband");
            if finished {
                self.complete_tuner();
            }
            return;
        }

        if stage.is_moving_xy() {
            if matches!(self.mode, Mode::Measuring | Mode::Timing)
                && (finished || !requested.is_zero())
            {
                trace!(%requested, "XY stage busy, tuner move deferred");
                self.deferred_step = Some((requested, finished));
            } else {
                trace!("XY stage busy");
            }
            self.predictor.advance(Vec2::ZERO);
            return;
        }

        let total = self.total_move + stage_move;
        let limit = self.config.stage.max_total_move;
        if total.x.abs() > limit || total.y.abs() > limit {
            self.stop_intern(AbortReason::TotalMoveExceeded { total, limit });
            return;
        }

        self.clock
            .wait_until_us(frame.capture_time_us + self.config.stage.command_delay_us);
        if !stage.move_xy(stage_move.x, stage_move.y, self.config.stage.xy_blocking) {
            self.stop_intern(AbortReason::StageRejected);
            return;
        }
        self.total_move = total;
        if resumed {
            self.tuner_move_issued(offset, now);
        }
        self.predictor.advance(stage_move);
        debug!(%offset, %stage_move, "Stage moved");
        self.events.emit(ControllerEvent::StageMoved {
            image_offset: offset,
            stage_move,
        });

        if finished {
            self.complete_tuner();
        }
    }

    /// Stage move wanted by the active mode, and whether the run ends with it.
    fn mode_function(
        &mut self,
        offset: Vec2,
        capture_time_us: u64,
        now_us: u64,
    ) -> std::result::Result<(Vec2, bool), AbortReason> {
        let step = match self.mode {
            Mode::Tracking => return Ok((self.transfer_function(offset), false)),
            Mode::Measuring => match self.measuring.as_mut() {
                Some(m) => m.step(offset, now_us)?,
                None => unreachable!("Measuring run without state"),
            },
            Mode::Timing => match self.timing.as_mut() {
                Some(t) => t.step(offset, capture_time_us, now_us)?,
                None => unreachable!("Timing run without state"),
            },
            Mode::ZStack => unreachable!("Z-stack frames never reach XY tracking"),
        };
        Ok((step.stage_move, step.finished))
    }

    fn tuner_move_issued(&mut self, offset: Vec2, now_us: u64) {
        if let Some(m) = self.measuring.as_mut() {
            m.move_issued(offset, now_us);
        }
        if let Some(t) = self.timing.as_mut() {
            t.move_issued(offset, now_us);
        }
    }

    /// Publish the result of a finished Measuring or Timing run and stop.
    fn complete_tuner(&mut self) {
        match self.mode {
            Mode::Measuring => {
                if let Some(pixel_size) = self.measured_pixel_size() {
                    self.config.stage.pixel_size_x = pixel_size.x;
                    self.config.stage.pixel_size_y = pixel_size.y;
                    self.events
                        .emit(ControllerEvent::PixelSizeMeasured { pixel_size });
                }
            }
            Mode::Timing => {
                self.timing_report = self.timing.as_ref().and_then(Timing::report);
                if let Some(report) = self.timing_report {
                    self.events.emit(ControllerEvent::TimingMeasured(report));
                }
            }
            Mode::Tracking | Mode::ZStack => unreachable!("only tuner modes finish on their own"),
        }
        self.finish_run();
    }

    /// Cap a move at a quarter of the field of view per axis. Larger
    /// apparent shifts mean the tracker lost the sample.
    fn saturate(&self, stage_move: Vec2, frame: &Frame) -> Vec2 {
        let px = self.config.stage.pixel_size();
        let limit_x = frame.width() as f64 * px.x.abs() * SATURATION_FRACTION;
        let limit_y = frame.height() as f64 * px.y.abs() * SATURATION_FRACTION;
        let clamped = Vec2::new(
            stage_move.x.clamp(-limit_x, limit_x),
            stage_move.y.clamp(-limit_y, limit_y),
        );
        if clamped != stage_move {
            debug!(requested = %stage_move, %clamped, "Stage move saturated");
        }
        clamped
    }

    /// Proportional control law with dead-time compensation: the image
    /// error in stage units minus the moves that are not yet visible.
    pub fn transfer_function(&self, image_offset: Vec2) -> Vec2 {
        (-self.stage_coordinates(image_offset) - self.predictor.pending())
            * self.config.control.controller_gain
    }

    /// Pixels to µm.
    pub fn stage_coordinates(&self, v: Vec2) -> Vec2 {
        let px = self.config.stage.pixel_size();
        Vec2::new(v.x * px.x, v.y * px.y)
    }

    /// µm to pixels.
    pub fn image_coordinates(&self, v: Vec2) -> Vec2 {
        let px = self.config.stage.pixel_size();
        Vec2::new(v.x / px.x, v.y / px.y)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("mode", &self.mode)
            .field("running", &self.running)
            .field("total_move", &self.total_move)
            .field("predictor", &self.predictor)
            .finish()
    }
}
