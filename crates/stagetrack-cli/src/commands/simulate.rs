use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use stagetrack_core::clock::{Clock, ManualClock};
use stagetrack_core::config::TrackingConfig;
use stagetrack_core::controller::{Controller, Mode};
use stagetrack_core::events::{ChannelSink, ControllerEvent};
use stagetrack_core::frame::{Frame, Vec2};
use stagetrack_core::io::save_frame;
use stagetrack_core::sim::{SceneConfig, SimulatedStage, SyntheticScene};
use stagetrack_core::stage::Stage;
use tracing::info;

use crate::summary::{print_simulation_summary, RunTally, SimulationReport};

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Tracking,
    Measuring,
    Timing,
    Zstack,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Tracking => Mode::Tracking,
            ModeArg::Measuring => Mode::Measuring,
            ModeArg::Timing => Mode::Timing,
            ModeArg::Zstack => Mode::ZStack,
        }
    }
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Controller mode to run
    #[arg(long, value_enum, default_value = "tracking")]
    pub mode: ModeArg,

    /// Tracking config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of frames to simulate
    #[arg(long, default_value = "500")]
    pub frames: usize,

    /// Time between frames (µs)
    #[arg(long, default_value = "20000")]
    pub frame_interval_us: u64,

    /// Stage command-to-motion latency (µs)
    #[arg(long, default_value = "40000")]
    pub latency_us: u64,

    /// Sample drift along X (µm/s)
    #[arg(long, default_value = "5.0", allow_hyphen_values = true)]
    pub drift_x: f64,

    /// Sample drift along Y (µm/s)
    #[arg(long, default_value = "-3.0", allow_hyphen_values = true)]
    pub drift_y: f64,

    /// True pixel size of the simulated optics (µm); defaults to the config
    #[arg(long)]
    pub pixel_size: Option<f64>,

    /// Enable Z autofocus; a Z-stack is acquired first
    #[arg(long)]
    pub track_z: bool,

    /// Defocus applied after the Z-stack (µm)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub defocus: f64,

    /// Scene texture seed
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Save the last simulated frame to this image file
    #[arg(long)]
    pub save_frame: Option<PathBuf>,

    /// Write the run summary to this TOML file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Simulator state shared by all phases of one invocation.
struct Simulation {
    clock: ManualClock,
    stage: SimulatedStage,
    scene: SyntheticScene,
    events: Receiver<ControllerEvent>,
    interval_us: u64,
    next_capture_us: u64,
    frame_index: u64,
    last_frame: Option<Frame>,
    tally: RunTally,
}

impl Simulation {
    /// Feed frames until the run ends or `max_frames` were rendered.
    fn drive(&mut self, controller: &mut Controller, max_frames: usize, label: &str) -> Result<()> {
        let pb = ProgressBar::new(max_frames as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40}] {pos}/{len}")?
                .progress_chars("=> "),
        );
        pb.set_message(label.to_string());

        for _ in 0..max_frames {
            let capture = self.next_capture_us;
            self.clock.wait_until_us(capture);
            let frame = self
                .scene
                .frame(self.stage.position(), capture, capture, self.frame_index);
            self.frame_index += 1;
            self.next_capture_us = capture + self.interval_us;

            controller.track_image(&frame);
            self.tally.frames += 1;
            self.last_frame = Some(frame);
            self.drain();
            pb.inc(1);
            if !controller.is_running() {
                break;
            }
        }
        pb.finish_and_clear();
        Ok(())
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.tally.record(event);
        }
    }

    /// Remaining sample displacement in the field of view (µm).
    fn residual(&self) -> Vec2 {
        let offset = self
            .scene
            .content_offset(self.stage.position(), self.clock.now_us());
        let px = self.scene.config().pixel_size;
        Vec2::new(offset.x * px.x, offset.y * px.y)
    }
}

pub fn run(args: &SimulateArgs) -> Result<()> {
    let mut config: TrackingConfig = if let Some(ref path) = args.config {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents).context("Invalid tracking config")?
    } else {
        TrackingConfig::default()
    };
    if args.track_z {
        config.control.track_z = true;
    }
    config.validate()?;
    let mode = Mode::from(args.mode);

    let clock = ManualClock::new(0);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let stage = SimulatedStage::new(shared_clock.clone(), args.latency_us);
    let true_pixel_size = args.pixel_size.unwrap_or(config.stage.pixel_size_x);
    let scene = SyntheticScene::new(SceneConfig {
        width: config.correlator.fft_width,
        height: config.correlator.fft_height,
        pixel_size: Vec2::new(true_pixel_size, true_pixel_size),
        drift_um_per_s: Vec2::new(args.drift_x, args.drift_y),
        seed: args.seed,
        ..SceneConfig::default()
    });

    let (sink, events) = ChannelSink::pair();
    let mut controller = Controller::new(config.clone(), shared_clock, Box::new(sink))?;
    controller.set_stage(Box::new(stage.clone()))?;

    let mut sim = Simulation {
        clock,
        stage,
        scene,
        events,
        interval_us: args.frame_interval_us,
        next_capture_us: 0,
        frame_index: 0,
        last_frame: None,
        tally: RunTally::default(),
    };

    if mode == Mode::Tracking && config.control.track_z {
        controller.set_mode(Mode::ZStack)?;
        controller.run()?;
        let budget = config.zstack.slice_count() * (config.zstack.frames_per_step + 8) + 32;
        sim.drive(&mut controller, budget, "Z-stack")?;
        if !controller.focus_tracker().is_ready() {
            bail!("Z-stack did not produce a focus model");
        }
        info!(frames = sim.tally.frames, "Focus model ready");
        if args.defocus != 0.0 && !sim.stage.move_z(args.defocus, true) {
            bail!("Simulated stage rejected the defocus move");
        }
    }

    controller.set_mode(mode)?;
    controller.run()?;
    sim.drive(&mut controller, args.frames, &mode.to_string())?;
    controller.stop();
    sim.drain();

    if let (Some(path), Some(frame)) = (&args.save_frame, sim.last_frame.as_ref()) {
        save_frame(frame, path)
            .with_context(|| format!("Failed to save frame to {}", path.display()))?;
    }

    let total_move = controller.total_move();
    let residual = sim.residual();
    if let Some(ref path) = args.report {
        let report = SimulationReport {
            mode,
            total_move,
            residual,
            events: &sim.tally,
        };
        std::fs::write(path, toml::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    print_simulation_summary(mode, &sim.tally, total_move, residual);
    Ok(())
}
