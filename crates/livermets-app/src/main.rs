//! Headless liver-metastasis scenario runner.
//!
//! Runs the two-phase chemo-resistance scenario: a burn-in period with only
//! background tumour cell death, followed by a treatment period with immune
//! attack on the tumour rim and resistance-modulated chemotherapy. Sampled
//! ticks are emitted as JSON lines. Settings come from `LIVERMETS_*`
//! environment variables; log verbosity from `RUST_LOG`.

use anyhow::{Context, Result};
use livermets_core::{
    CullingPolicy, PersistenceBatch, Position, ResistanceModulation, TissueConfig,
    TissuePersistence, TissueState,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::str::FromStr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("could not parse {name}={raw}")),
        Err(_) => Ok(default),
    }
}

/// Runtime settings for the scenario, layered over the scenario defaults.
#[derive(Debug)]
struct Settings {
    seed: u64,
    dt_hours: f64,
    burn_in_hours: f64,
    treatment_hours: f64,
    background_death_per_hour: f64,
    immune_death_per_hour: f64,
    chemo_death_per_hour: f64,
    resistance_drift_rate: f64,
    cell_limit: usize,
    sampling_multiple: u32,
    output_path: Option<String>,
}

impl Settings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            seed: env_parsed("LIVERMETS_SEED", 0)?,
            dt_hours: env_parsed("LIVERMETS_DT_HOURS", 0.01)?,
            burn_in_hours: env_parsed("LIVERMETS_BURN_IN_HOURS", 100.0)?,
            treatment_hours: env_parsed("LIVERMETS_TREATMENT_HOURS", 100.0)?,
            background_death_per_hour: env_parsed("LIVERMETS_BACKGROUND_DEATH", 0.005)?,
            immune_death_per_hour: env_parsed("LIVERMETS_IMMUNE_DEATH", 0.05)?,
            chemo_death_per_hour: env_parsed("LIVERMETS_CHEMO_DEATH", 0.0)?,
            resistance_drift_rate: env_parsed("LIVERMETS_DRIFT_RATE", 0.01)?,
            cell_limit: env_parsed("LIVERMETS_CELL_LIMIT", 2000)?,
            sampling_multiple: env_parsed("LIVERMETS_SAMPLING_MULTIPLE", 100)?,
            output_path: std::env::var("LIVERMETS_OUTPUT").ok(),
        })
    }

    fn ticks_for(&self, hours: f64) -> u64 {
        (hours / self.dt_hours).round() as u64
    }
}

/// Persistence sink writing one JSON object per sampled tick.
struct JsonLinesPersistence {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl JsonLinesPersistence {
    fn create(path: Option<&str>) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(
                File::create(path).with_context(|| format!("could not create {path}"))?,
            ),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self {
            writer: BufWriter::new(sink),
        })
    }
}

impl TissuePersistence for JsonLinesPersistence {
    fn on_tick(&mut self, batch: &PersistenceBatch) {
        let line = match serde_json::to_string(batch) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize persistence batch");
                return;
            }
        };
        if let Err(err) = writeln!(self.writer, "{line}") {
            warn!(error = %err, "failed to write persistence batch");
        }
    }
}

fn bootstrap_tissue(settings: &Settings) -> Result<TissueState> {
    let config = TissueConfig {
        dt_hours: settings.dt_hours,
        rng_seed: Some(settings.seed),
        resistance_drift_rate: Some(settings.resistance_drift_rate),
        cell_limit: settings.cell_limit,
        sampling_multiple: settings.sampling_multiple,
        ..TissueConfig::default()
    };
    let persistence = JsonLinesPersistence::create(settings.output_path.as_deref())?;
    let mut tissue = TissueState::with_persistence(config, Box::new(persistence))
        .context("invalid tissue configuration")?;
    tissue.add_policy(
        CullingPolicy::background(settings.background_death_per_hour)
            .context("invalid background death probability")?,
    );
    tissue.seed_cell(Position::new(0.0, 0.0));
    Ok(tissue)
}

/// Step until `ticks` have run or the population guard trips. Returns false
/// if the guard ended the phase early.
fn run_phase(tissue: &mut TissueState, label: &str, ticks: u64) -> bool {
    for _ in 0..ticks {
        let summary = tissue.step();
        if summary.limit_exceeded {
            warn!(
                phase = label,
                tick = summary.tick.0,
                hours = summary.hours,
                cell_count = summary.cell_count,
                limit = tissue.guard().limit(),
                "population limit exceeded, stopping"
            );
            return false;
        }
    }
    true
}

fn report(tissue: &TissueState, label: &str) {
    if let Some(summary) = tissue.history().last() {
        info!(
            phase = label,
            tick = summary.tick.0,
            hours = summary.hours,
            cell_count = summary.cell_count,
            mean_resistance = summary.mean_resistance,
            boundary_size = summary.boundary_size,
            "phase complete"
        );
    }
}

fn main() -> Result<()> {
    init_tracing();
    let settings = Settings::from_env()?;
    info!(?settings, "starting liver-metastasis scenario");

    let mut tissue = bootstrap_tissue(&settings)?;

    let burn_in_ticks = settings.ticks_for(settings.burn_in_hours);
    info!(ticks = burn_in_ticks, "burn-in: background death only");
    if !run_phase(&mut tissue, "burn_in", burn_in_ticks) {
        return Ok(());
    }
    report(&tissue, "burn_in");

    tissue.add_policy(
        CullingPolicy::boundary(settings.immune_death_per_hour)
            .context("invalid immune death probability")?,
    );
    if settings.chemo_death_per_hour > 0.0 {
        tissue.add_policy(
            CullingPolicy::chemotherapy(
                settings.chemo_death_per_hour,
                ResistanceModulation::default(),
            )
            .context("invalid chemotherapy death probability")?,
        );
    }

    let treatment_ticks = settings.ticks_for(settings.treatment_hours);
    info!(
        ticks = treatment_ticks,
        "treatment: immune attack on the rim plus chemotherapy"
    );
    if !run_phase(&mut tissue, "treatment", treatment_ticks) {
        return Ok(());
    }
    report(&tissue, "treatment");

    info!(
        final_cell_count = tissue.cell_count(),
        "scenario finished"
    );
    Ok(())
}
