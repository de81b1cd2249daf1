//! Batch parameter sweep. Every (layout seed, step seed, probability,
//! mix) cell is an independent, fully data-isolated simulation, so the
//! grid fans out across the thread pool and the results reduce by plain
//! concatenation.

use anyhow::{Context, Result};
use autopoiesis_core::{CycleRecord, KindWeights, SharedLog, World, WorldConfig};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use tracing::info;

const GRID_SIZE: u32 = 10;
const LAYOUT_SEEDS: std::ops::Range<u64> = 0..5;
const STEP_SEEDS: std::ops::Range<u64> = 100..105;

/// One finished simulation run.
#[derive(Debug, Serialize)]
struct SweepCell {
    disintegrate_prob: f64,
    weights: KindWeights,
    layout_seed: u64,
    step_seed: u64,
    records: Vec<CycleRecord>,
}

/// Aggregate over all seed pairs of one (probability, mix) setting.
#[derive(Debug, Serialize)]
struct SweepSummary {
    disintegrate_prob: f64,
    weights: KindWeights,
    cycles: usize,
    mean_length: f64,
    mean_lifetime: f64,
}

#[derive(Debug, Serialize)]
struct SweepReport {
    ticks: u64,
    summary: Vec<SweepSummary>,
    cells: Vec<SweepCell>,
}

fn parameter_grid() -> (Vec<f64>, Vec<KindWeights>) {
    let probs: Vec<f64> = (1..=5).map(|i| f64::from(i) * 0.02).collect();
    let mixes: Vec<KindWeights> = (0u32..45)
        .step_by(5)
        .map(|i| KindWeights {
            hole: 9 + i / 2,
            substrate: 90 - i,
            catalyst: 1 + i / 2,
        })
        .collect();
    (probs, mixes)
}

pub fn run(out: &Path, ticks: u64) -> Result<()> {
    let (probs, mixes) = parameter_grid();
    let mut params = Vec::new();
    for &prob in &probs {
        for &weights in &mixes {
            for layout_seed in LAYOUT_SEEDS {
                for step_seed in STEP_SEEDS {
                    params.push((prob, weights, layout_seed, step_seed));
                }
            }
        }
    }
    info!(runs = params.len(), ticks, "starting sweep");

    let cells: Vec<SweepCell> = params
        .into_par_iter()
        .map(|(prob, weights, layout_seed, step_seed)| -> Result<SweepCell> {
            let config = WorldConfig {
                size: GRID_SIZE,
                disintegrate_prob: prob,
                max_ticks: ticks,
                layout_seed: Some(layout_seed),
                step_seed: Some(step_seed),
                ..WorldConfig::default()
            };
            let log = SharedLog::new();
            let mut world = World::random(config, weights)?;
            world.set_sink(Box::new(log.clone()));
            world.run_to_completion();
            Ok(SweepCell {
                disintegrate_prob: prob,
                weights,
                layout_seed,
                step_seed,
                records: log.records(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut summary = Vec::new();
    for &prob in &probs {
        for &weights in &mixes {
            let records: Vec<&CycleRecord> = cells
                .iter()
                .filter(|c| c.disintegrate_prob == prob && c.weights == weights)
                .flat_map(|c| c.records.iter())
                .collect();
            let cycles = records.len();
            let (mean_length, mean_lifetime) = if cycles == 0 {
                (0.0, 0.0)
            } else {
                (
                    records.iter().map(|r| r.length as f64).sum::<f64>() / cycles as f64,
                    records.iter().map(|r| r.duration() as f64).sum::<f64>() / cycles as f64,
                )
            };
            println!(
                "p={prob:.2} mix=({}/{}/{}) cycles={cycles} mean_length={mean_length:.2} mean_lifetime={mean_lifetime:.2}",
                weights.hole, weights.substrate, weights.catalyst
            );
            summary.push(SweepSummary {
                disintegrate_prob: prob,
                weights,
                cycles,
                mean_length,
                mean_lifetime,
            });
        }
    }

    let report = SweepReport {
        ticks,
        summary,
        cells,
    };
    let file = File::create(out)
        .with_context(|| format!("failed to create sweep output {}", out.display()))?;
    serde_json::to_writer_pretty(file, &report).context("failed to serialize sweep report")?;
    info!(out = %out.display(), "sweep complete");
    Ok(())
}
