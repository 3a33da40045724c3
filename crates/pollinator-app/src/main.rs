//! Headless command line runner: builds a world from CLI flags, steps it for a
//! fixed number of ticks, and reports summaries through `tracing` (and
//! optionally a JSON history dump).

use anyhow::{Context, Result};
use clap::Parser;
use pollinator_core::{PollinatorConfig, Sensitivity, Species, TickSummary, WorldState};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pollinator", about = "Pollinator foraging and pesticide exposure simulation")]
struct Cli {
    /// Species to simulate: honeybee, bumblebee, or solitary.
    #[arg(long, default_value = "honeybee")]
    species: Species,

    /// Pesticide sensitivity class: low, moderate, or high.
    #[arg(long, default_value = "moderate")]
    sensitivity: Sensitivity,

    /// Number of ticks to run.
    #[arg(long, default_value_t = 1000)]
    ticks: u64,

    /// World width in world units.
    #[arg(long, default_value_t = 150.0)]
    width: f32,

    /// World height in world units.
    #[arg(long, default_value_t = 150.0)]
    height: f32,

    /// Initial bee population.
    #[arg(long, default_value_t = 100)]
    bees: usize,

    /// Number of flowers scattered at setup.
    #[arg(long, default_value_t = 200)]
    flowers: usize,

    /// Number of hives placed at setup.
    #[arg(long, default_value_t = 2)]
    hives: usize,

    /// Fraction of flowers that start contaminated.
    #[arg(long, default_value_t = 0.7)]
    pesticide_ratio: f64,

    /// Food a hive must hold (and pays) per birth; omit for free reproduction.
    #[arg(long)]
    reproduction_food_cost: Option<f64>,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Tick summaries retained in memory (and dumped with --output).
    #[arg(long, default_value_t = 1024)]
    history: usize,

    /// Log a progress summary every N ticks.
    #[arg(long, default_value_t = 100)]
    report_every: u64,

    /// Write the retained tick history as JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn to_config(&self) -> PollinatorConfig {
        PollinatorConfig {
            species: self.species,
            sensitivity: self.sensitivity,
            world_width: self.width,
            world_height: self.height,
            initial_bees: self.bees,
            flower_count: self.flowers,
            hive_count: self.hives,
            pesticide_ratio: self.pesticide_ratio,
            reproduction_food_cost: self.reproduction_food_cost,
            rng_seed: self.seed,
            history_capacity: self.history,
            ..PollinatorConfig::default()
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = cli.to_config();
    let mut world = WorldState::new(config).context("failed to build world")?;
    info!(
        species = %cli.species,
        sensitivity = %cli.sensitivity,
        bees = cli.bees,
        flowers = cli.flowers,
        hives = cli.hives,
        pesticide_ratio = cli.pesticide_ratio,
        "Starting pollinator simulation",
    );

    let report_every = cli.report_every.max(1);
    let mut last = None;
    for _ in 0..cli.ticks {
        let summary = world.step();
        if summary.tick.0 % report_every == 0 {
            report(&summary);
        }
        last = Some(summary);
        if world.population() == 0 {
            warn!(tick = world.tick().0, "Population extinct, stopping early");
            break;
        }
    }

    if let Some(summary) = last {
        info!(
            tick = summary.tick.0,
            population = summary.population,
            contaminated = summary.contaminated_bees,
            mean_exposure = summary.mean_exposure,
            hive_food = summary.hive_food_total,
            "Run complete",
        );
    } else {
        warn!("Run finished without executing any ticks");
    }

    if let Some(path) = cli.output.as_ref() {
        let history: Vec<&TickSummary> = world.history().collect();
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &history)
            .context("failed to serialize tick history")?;
        info!(path = %path.display(), entries = history.len(), "Wrote tick history");
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn report(summary: &TickSummary) {
    info!(
        tick = summary.tick.0,
        population = summary.population,
        births = summary.births,
        deaths = summary.deaths,
        mean_exposure = summary.mean_exposure,
        contaminated = summary.contaminated_bees,
        mean_nectar = summary.mean_nectar,
        hive_food = summary.hive_food_total,
        "Tick summary",
    );
}
