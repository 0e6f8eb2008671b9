#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use stagetrack_core::clock::{Clock, ManualClock};
use stagetrack_core::config::TrackingConfig;
use stagetrack_core::controller::Controller;
use stagetrack_core::events::{ControllerEvent, EventSink};
use stagetrack_core::frame::Frame;
use stagetrack_core::sim::{SceneConfig, SimulatedStage, SyntheticScene};
use stagetrack_core::stage::{Stage, StagePosition};

/// Shared, inspectable list of emitted controller events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<ControllerEvent>>>);

impl EventLog {
    pub fn push(&self, event: ControllerEvent) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<ControllerEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ControllerEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Event sink that records into an [`EventLog`].
pub struct RecordingSink(pub EventLog);

impl EventSink for RecordingSink {
    fn emit(&self, event: ControllerEvent) {
        self.0.push(event);
    }
}

/// Noise-free scene whose texture tile matches the frame size, so integer
/// pixel shifts are exact cyclic rolls.
pub fn scene_config(size: usize, pixel_size: f64) -> SceneConfig {
    SceneConfig {
        width: size,
        height: size,
        tile_size: size,
        pixel_size: stagetrack_core::frame::Vec2::new(pixel_size, pixel_size),
        noise: 0.0,
        seed: 42,
        ..SceneConfig::default()
    }
}

/// Untimed frame with the content shifted by (`dx`, `dy`) pixels.
pub fn shifted_frame(scene: &SyntheticScene, dx: f64, dy: f64) -> Frame {
    let px = scene.config().pixel_size;
    let stage = StagePosition {
        x: dx * px.x,
        y: dy * px.y,
        z: scene.config().focus_z,
    };
    Frame::untimed(scene.render(stage, 0, 0))
}

/// Small, fast config for simulator runs.
pub fn small_config(fft: usize) -> TrackingConfig {
    let mut config = TrackingConfig::default();
    config.correlator.fft_width = fft;
    config.correlator.fft_height = fft;
    config.correlator.track_depth = 2;
    config
}

/// Controller wired to a manual clock, a simulated stage and a scene.
pub struct Rig {
    pub clock: ManualClock,
    pub stage: SimulatedStage,
    pub scene: SyntheticScene,
    pub controller: Controller,
    pub events: EventLog,
    pub interval_us: u64,
    next_capture_us: u64,
    frame_index: u64,
}

impl Rig {
    pub fn new(config: TrackingConfig, scene: SceneConfig, latency_us: u64) -> Self {
        let clock = ManualClock::new(0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let stage = SimulatedStage::new(shared.clone(), latency_us);
        let events = EventLog::default();
        let mut controller =
            Controller::new(config, shared, Box::new(RecordingSink(events.clone()))).unwrap();
        controller.set_stage(Box::new(stage.clone())).unwrap();
        Self {
            clock,
            stage,
            scene: SyntheticScene::new(scene),
            controller,
            events,
            interval_us: 20_000,
            next_capture_us: 20_000,
            frame_index: 0,
        }
    }

    /// Advance the clock to the next capture time and return its timestamp.
    fn tick(&mut self) -> u64 {
        let capture = self.next_capture_us.max(self.clock.now_us());
        self.clock.wait_until_us(capture);
        self.next_capture_us = capture + self.interval_us;
        self.frame_index += 1;
        capture
    }

    /// Frame of the scene under the stage's current position.
    pub fn capture(&mut self) -> Frame {
        let capture = self.tick();
        self.scene
            .frame(self.stage.position(), capture, capture, self.frame_index)
    }

    /// Frame showing the content at a fixed pixel offset, whatever the stage did.
    pub fn capture_shifted(&mut self, dx: f64, dy: f64) -> Frame {
        let capture = self.tick();
        let mut frame = shifted_frame(&self.scene, dx, dy);
        frame.capture_time_us = capture;
        frame.process_time_us = capture;
        frame
    }

    pub fn step(&mut self) {
        let frame = self.capture();
        self.controller.track_image(&frame);
    }

    pub fn step_shifted(&mut self, dx: f64, dy: f64) {
        let frame = self.capture_shifted(dx, dy);
        self.controller.track_image(&frame);
    }

    /// Process up to `n` frames; stops early when the run ends. Returns the
    /// number of frames processed.
    pub fn run_frames(&mut self, n: usize) -> usize {
        for i in 0..n {
            if !self.controller.is_running() {
                return i;
            }
            self.step();
        }
        n
    }

    pub fn xy_moves(&self) -> usize {
        self.stage
            .history()
            .iter()
            .filter(|c| matches!(c.command, stagetrack_core::sim::StageCommand::Xy { .. }))
            .count()
    }
}
