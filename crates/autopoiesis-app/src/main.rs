//! Console driver for the autopoiesis engine: single runs with a live
//! grid view, and a batch parameter sweep over seeds, disintegration
//! probabilities, and particle mixes.

use anyhow::{Context, Result};
use autopoiesis_core::{KindWeights, SharedLog, World, WorldConfig};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

mod sweep;

#[derive(Parser, Debug)]
#[command(
    name = "autopoiesis",
    version,
    about = "Lattice artificial-chemistry simulator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one simulation and print the grid every tick.
    Run {
        /// Path to a JSON world configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Draw a weighted-random layout even when a configuration file
        /// provides explicit placements.
        #[arg(long)]
        random: bool,
        /// Suppress the per-tick grid view.
        #[arg(long)]
        quiet: bool,
    },
    /// Fan out independent runs across seeds, probabilities, and mixes.
    Sweep {
        /// Where to write the JSON result table.
        #[arg(long, default_value = "sweep.json")]
        out: PathBuf,
        /// Ticks per simulation run.
        #[arg(long, default_value_t = 1000)]
        ticks: u64,
    },
}

fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Run {
            config,
            random,
            quiet,
        } => run(config.as_deref(), random, quiet),
        Command::Sweep { out, ticks } => sweep::run(&out, ticks),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<WorldConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))
        }
        None => Ok(WorldConfig::default()),
    }
}

fn run(config_path: Option<&Path>, random: bool, quiet: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let max_ticks = config.max_ticks;
    let log = SharedLog::new();
    let mut world = if random || config_path.is_none() {
        World::random(config, KindWeights::default())?
    } else {
        World::new(config)?
    };
    world.set_sink(Box::new(log.clone()));
    info!(size = world.size(), ticks = max_ticks, "starting run");

    for _ in 0..max_ticks {
        if !quiet {
            println!("tick {}", world.tick().0);
            println!("{}", world.render_ascii());
        }
        world.step();
    }
    if !quiet {
        println!("tick {}", world.tick().0);
        println!("{}", world.render_ascii());
    }
    world.flush_cycles();

    let stats = log.snapshot();
    println!("recorded {} cycle lifetimes", stats.len());
    if let (Some(length), Some(lifetime)) = (stats.mean_length(), stats.mean_lifetime()) {
        println!("mean length {length:.2}, mean lifetime {lifetime:.2} ticks");
    }
    for record in stats.records() {
        println!(
            "  birth={} death={} length={}",
            record.birth.0, record.death.0, record.length
        );
    }
    Ok(())
}
