use anyhow::Context;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use ventsim::noise::RngNoise;
use ventsim::{run_session, SimulatorConfig};

#[derive(Parser)]
#[command(name = "ventsim")]
#[command(about = "Headless ventilator, anesthesia machine and high-flow session simulator")]
struct Cli {
    /// Scenario configuration file path
    #[arg(short, long)]
    config: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Random seed for reproducibility, overrides the scenario seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Session duration in seconds, overrides the scenario duration
    #[arg(short, long)]
    duration: Option<f64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Load configuration
    let mut config = SimulatorConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Some(duration) = cli.duration {
        config.session.duration_s = duration;
        config.validate().context("Invalid session duration")?;
    }
    let seed = cli.seed.or(config.session.seed);
    match seed {
        Some(seed) => info!("Starting {:.0} s session (seed: {})", config.session.duration_s, seed),
        None => info!("Starting {:.0} s session (random seed)", config.session.duration_s),
    }

    let result = run_session(&config, RngNoise::new(seed))?;
    info!(
        "Session completed: {} ticks, {} waveform samples, {} events",
        result.ticks.len(),
        result.waveform.len(),
        result.events.len()
    );

    // Create output directory if it doesn't exist
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create output directory {:?}", cli.output))?;

    // Save results
    ventsim::output::save_results(&result, config.session.duration_s, &cli.output)?;
    ventsim::output::generate_report(&result, config.session.duration_s, &cli.output)?;
    info!("Results saved to {:?}", cli.output);

    Ok(())
}
