use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use console::Style;
use stagetrack_core::config::TrackingConfig;

#[derive(Args)]
pub struct ConfigArgs {
    /// Validate this tracking config instead of printing the defaults
    #[arg(long, conflicts_with = "output")]
    pub check: Option<PathBuf>,

    /// Write the default config to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn run(args: &ConfigArgs) -> Result<()> {
    if let Some(ref path) = args.check {
        return check(path);
    }

    let toml_str = toml::to_string_pretty(&TrackingConfig::default())?;
    match args.output {
        Some(ref path) => {
            std::fs::write(path, &toml_str)
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            println!("Default tracking config saved to {}", path.display());
        }
        None => print!("{toml_str}"),
    }
    Ok(())
}

/// Parse and validate a config file; missing keys take their defaults.
fn check(path: &PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: TrackingConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid tracking config {}", path.display()))?;

    let ok = Style::new().green().bold();
    println!(
        "{} {} (FFT {}x{}, depth {}, pixel size {} µm)",
        ok.apply_to("valid"),
        path.display(),
        config.correlator.fft_width,
        config.correlator.fft_height,
        config.correlator.track_depth,
        config.stage.pixel_size(),
    );
    Ok(())
}
