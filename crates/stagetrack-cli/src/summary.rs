use console::Style;
use serde::Serialize;
use stagetrack_core::controller::{Mode, TimingReport};
use stagetrack_core::events::ControllerEvent;
use stagetrack_core::focus::FocusValue;
use stagetrack_core::frame::Vec2;

/// What happened during a simulated run, collected from controller events.
#[derive(Default, Serialize)]
pub struct RunTally {
    pub frames: usize,
    pub stage_moves: usize,
    pub z_moves: usize,
    pub fps: Option<f64>,
    pub last_focus: Option<FocusValue>,
    pub pixel_size: Option<Vec2>,
    pub timing: Option<TimingReport>,
    pub zstack: Option<(usize, f64)>,
    pub autofocus_captures: usize,
    pub aborted: Option<String>,
}

impl RunTally {
    pub fn record(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::StageMoved { .. } => self.stage_moves += 1,
            ControllerEvent::ZMoved { .. } => self.z_moves += 1,
            ControllerEvent::FrameRate { fps } => self.fps = Some(fps),
            ControllerEvent::Focus(value) => self.last_focus = Some(value),
            ControllerEvent::PixelSizeMeasured { pixel_size } => self.pixel_size = Some(pixel_size),
            ControllerEvent::TimingMeasured(report) => self.timing = Some(report),
            ControllerEvent::ZStackAcquired { samples, best_z } => {
                self.zstack = Some((samples, best_z))
            }
            ControllerEvent::AutofocusCapture { .. } => self.autofocus_captures += 1,
            ControllerEvent::Aborted { reason, .. } => self.aborted = Some(reason.to_string()),
            _ => {}
        }
    }
}

/// Machine-readable outcome of `simulate`, written with `--report`.
#[derive(Serialize)]
pub struct SimulationReport<'a> {
    pub mode: Mode,
    pub total_move: Vec2,
    pub residual: Vec2,
    pub events: &'a RunTally,
}

struct Styles {
    title: Style,
    label: Style,
    value: Style,
    good: Style,
    bad: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            good: Style::new().green(),
            bad: Style::new().red().bold(),
        }
    }
}

pub fn print_simulation_summary(mode: Mode, tally: &RunTally, total_move: Vec2, residual: Vec2) {
    let s = Styles::new();
    let row = |label: &str, value: String| {
        println!("  {:<18}{}", s.label.apply_to(label), s.value.apply_to(value));
    };

    println!();
    println!("  {}", s.title.apply_to(format!("Simulation: {mode}")));
    println!();

    row("Frames", tally.frames.to_string());
    if let Some(fps) = tally.fps {
        row("Frame rate", format!("{fps:.1} fps"));
    }
    row("XY moves", tally.stage_moves.to_string());
    row("Total XY travel", format!("{total_move} µm"));
    row("Residual offset", format!("{residual} µm"));
    if tally.z_moves > 0 {
        row("Z moves", tally.z_moves.to_string());
    }
    if let Some(focus) = tally.last_focus {
        row(
            "Focus",
            format!("{:.1} (avg {:.1})", focus.brenner, focus.avg_brenner),
        );
    }
    if let Some((samples, best_z)) = tally.zstack {
        row("Z-stack", format!("{samples} slices, best at {best_z:+.2} µm"));
    }
    if tally.autofocus_captures > 0 {
        row("AF captures", tally.autofocus_captures.to_string());
    }
    if let Some(px) = tally.pixel_size {
        println!(
            "  {:<18}{}",
            s.label.apply_to("Pixel size"),
            s.good.apply_to(format!("{px} µm/px"))
        );
    }
    if let Some(t) = tally.timing {
        println!(
            "  {:<18}{}",
            s.label.apply_to("Stage latency"),
            s.good.apply_to(format!(
                "{:.0} µs, {:.1} frames -> predictor size {}",
                t.mean_latency_us, t.mean_latency_frames, t.suggested_predictor_size
            ))
        );
    }
    if let Some(ref reason) = tally.aborted {
        println!(
            "  {:<18}{}",
            s.label.apply_to("Aborted"),
            s.bad.apply_to(reason)
        );
    }
    println!();
}
