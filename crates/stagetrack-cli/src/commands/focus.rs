use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use stagetrack_core::config::FocusConfig;
use stagetrack_core::focus::{centered_roi, FocusMetrics};
use stagetrack_core::io::load_frame;

#[derive(Args)]
pub struct FocusArgs {
    /// Image files to score
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Centered ROI as a percentage of each dimension
    #[arg(long, default_value = "50")]
    pub roi: f64,

    /// Brenner neighbor distance in pixels
    #[arg(long, default_value = "2")]
    pub offset: usize,

    /// Ignore squared differences at or below this (8-bit scale)
    #[arg(long, default_value = "0")]
    pub threshold: f64,
}

pub fn run(args: &FocusArgs) -> Result<()> {
    let check = FocusConfig {
        roi_percentage: args.roi,
        brenner_offset: args.offset,
        brenner_threshold: args.threshold,
        ..FocusConfig::default()
    };
    check.validate()?;

    let pb = ProgressBar::new(args.files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    pb.set_message("Scoring images");

    let scored: Vec<(PathBuf, FocusMetrics)> = args
        .files
        .par_iter()
        .map(|path| -> Result<(PathBuf, FocusMetrics)> {
            let frame = load_frame(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let roi = centered_roi(frame.height(), frame.width(), args.roi);
            let metrics = FocusMetrics::compute(&roi.view(&frame.data), args.offset, args.threshold);
            pb.inc(1);
            Ok((path.clone(), metrics))
        })
        .collect::<Result<_>>()?;
    pb.finish_with_message("Scored");

    let best = scored
        .iter()
        .map(|(_, m)| m.brenner)
        .fold(f64::NEG_INFINITY, f64::max);
    let best_style = Style::new().green().bold();
    let dim = Style::new().dim();

    println!();
    println!(
        "{:>14}  {:>8}  {:>6}  {:>7}  {}",
        "Brenner", "Log", "Max", "Noise", "File"
    );
    println!("{}", dim.apply_to("-".repeat(60)));
    for (path, m) in &scored {
        let line = format!(
            "{:>14.1}  {:>8.3}  {:>6.3}  {:>7.3}  {}",
            m.brenner,
            m.focus,
            m.max_intensity,
            m.noise_level,
            path.display()
        );
        if m.brenner == best && scored.len() > 1 {
            println!("{}", best_style.apply_to(line));
        } else {
            println!("{line}");
        }
    }

    Ok(())
}
