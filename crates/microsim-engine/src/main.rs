//! Microsimulation binary.
//!
//! Wires a synthetic cardiovascular cohort into the engine, optionally
//! calibrates background mortality against a target annual death rate,
//! and runs the model while logging one summary per simulated year.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `microsim-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Create the clock and read the model sections
//! 4. Build the synthetic cohort and the simulator
//! 5. Start a scoped worker pool when `simulation.workers > 0`
//! 6. Calibrate background mortality when enabled
//! 7. Run the simulation year by year, then release the pool
//! 8. Log the result

mod error;
mod model;

use std::collections::BTreeMap;
use std::path::Path;

use microsim_core::config::{CalibrationConfig, LoggingConfig};
use microsim_core::{
    CalibrationSpec, Clock, ClusterSpec, MicrosimConfig, NelderMead, Seeds, Simulator,
};
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::model::{CalibrationTarget, ModelConfig, PopulationConfig, Summary};

/// Configuration file looked up in the working directory.
const CONFIG_PATH: &str = "microsim-config.yaml";

/// Name of the calibrated event.
const CALIBRATED_EVENT: &str = "background_mortality";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any initialization step, the calibration or the
/// simulation itself fails.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(
        seed = config.simulation.seed,
        ticks = config.simulation.ticks,
        workers = config.simulation.workers,
        backend = %config.simulation.backend,
        unit = config.clock.unit,
        "Configuration loaded"
    );

    // 3. Clock and model sections.
    let clock = Clock::new(&config.clock.unit, config.clock.origin)?;
    let years_per_tick = clock.unit().days() / 365.0;
    let population_config: PopulationConfig = load_section("population")?;
    let model_config: ModelConfig = load_section("model")?;

    // 4. Cohort and simulator.
    let seed = config.simulation.seed;
    let (manipulation, accumulation) = model::event_trees(&model_config, years_per_tick);
    let mut simulator = Simulator::new(
        || model::synthetic_population(&population_config, seed),
        manipulation,
        accumulation,
        clock,
        Seeds::Single(seed),
    )?;
    let last_cohort_id = i64::try_from(population_config.size).unwrap_or(i64::MAX);
    info!(
        individuals = simulator.get_population().len(),
        events = simulator.trees().events().len(),
        "Cohort created"
    );

    // 5-7. Worker pool, calibration and run. The guard releases the pool
    // on every exit path.
    if config.simulation.workers > 0 {
        let mut cluster = simulator.cluster(&ClusterSpec {
            workers: config.simulation.workers,
            backend: config.simulation.backend,
        })?;
        simulate(&mut cluster, &config, years_per_tick, last_cohort_id)?;
    } else {
        simulate(&mut simulator, &config, years_per_tick, last_cohort_id)?;
    }

    // 8. Report.
    let final_summary = Summary::of(simulator.get_population())
        .map_err(|source| EngineError::Summary { source })?;
    info!(
        total_ticks = simulator.tick(),
        rows = final_summary.rows,
        living = final_summary.living,
        cohort_deaths = model::cohort_death_fraction(simulator.get_population(), last_cohort_id)
            .unwrap_or_default(),
        "microsim-engine shutdown complete"
    );

    Ok(())
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over
/// `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Load the engine configuration from `microsim-config.yaml`, or defaults
/// when the file is absent.
fn load_config() -> Result<MicrosimConfig, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    if config_path.exists() {
        Ok(MicrosimConfig::from_file(config_path)?)
    } else {
        // Logging is not up yet; the defaults are reported once it is.
        Ok(MicrosimConfig::parse("")?)
    }
}

/// Load one model-owned section of `microsim-config.yaml`.
///
/// Missing file or missing key yields the section's defaults.
fn load_section<T: DeserializeOwned + Default>(key: &str) -> Result<T, EngineError> {
    let config_path = Path::new(CONFIG_PATH);
    if !config_path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(config_path).map_err(|e| EngineError::Model {
        message: format!("failed to read config file: {e}"),
    })?;
    parse_section(&contents, key)
}

fn parse_section<T: DeserializeOwned + Default>(
    contents: &str,
    key: &str,
) -> Result<T, EngineError> {
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    let raw: serde_yml::Value = serde_yml::from_str(contents).map_err(|e| EngineError::Model {
        message: format!("failed to parse config YAML: {e}"),
    })?;
    raw.get(key).map_or_else(
        || Ok(T::default()),
        |value| {
            serde_yml::from_value(value.clone()).map_err(|e| EngineError::Model {
                message: format!("failed to parse `{key}` section: {e}"),
            })
        },
    )
}

/// Whole ticks per simulated year (at least one).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ticks_per_year(years_per_tick: f64) -> u64 {
    years_per_tick.recip().round().max(1.0) as u64
}

/// Optionally calibrate, then run the configured number of ticks.
fn simulate(
    simulator: &mut Simulator,
    config: &MicrosimConfig,
    years_per_tick: f64,
    last_cohort_id: i64,
) -> Result<(), EngineError> {
    if config.calibration.enabled {
        let target: CalibrationTarget = load_section("calibration")?;
        calibrate_background_mortality(
            simulator,
            &config.calibration,
            &target,
            years_per_tick,
            last_cohort_id,
        )?;
    }
    run_with_summaries(
        simulator,
        config.simulation.ticks,
        ticks_per_year(years_per_tick),
    )
}

/// Fit the background mortality rate so the tick-0 cohort dies at the
/// target annual rate.
fn calibrate_background_mortality(
    simulator: &mut Simulator,
    config: &CalibrationConfig,
    target: &CalibrationTarget,
    years_per_tick: f64,
    last_cohort_id: i64,
) -> Result<(), EngineError> {
    let goal = target.target_annual_mortality;
    if !(goal > 0.0 && goal < 1.0) {
        return Err(EngineError::Model {
            message: format!("calibration.target_annual_mortality must be in (0, 1), got {goal}"),
        });
    }
    let initial = simulator
        .parameters()
        .get(CALIBRATED_EVENT)
        .and_then(|params| params.first().copied())
        .ok_or_else(|| EngineError::Model {
            message: format!("event `{CALIBRATED_EVENT}` has no parameters"),
        })?;

    let spec = CalibrationSpec {
        t_sim: config.ticks,
        events: BTreeMap::from([(CALIBRATED_EVENT.to_owned(), vec![0])]),
        initial_parameters: vec![initial],
        auto_commit: config.auto_commit,
        seeds: None,
    };
    let years = config.ticks as f64 * years_per_tick;
    info!(
        target = goal,
        initial,
        trial_ticks = config.ticks,
        "Calibrating background mortality"
    );

    let mut minimizer = NelderMead::new(config.optimizer);
    let outcome = simulator.calibrate(
        &spec,
        &mut minimizer,
        |population| model::cohort_death_fraction(population, last_cohort_id),
        |fraction| {
            let annual = model::annualize(*fraction, years);
            Ok(((annual - goal) / goal).powi(2))
        },
    )?;

    info!(
        rate = outcome.vector.first().copied().unwrap_or(initial),
        score = outcome.score,
        converged = outcome.converged,
        evaluations = outcome.evaluations,
        committed = outcome.committed,
        "Background mortality calibrated"
    );
    Ok(())
}

/// Run `ticks` ticks in yearly slices, logging a summary after each.
fn run_with_summaries(
    simulator: &mut Simulator,
    ticks: u64,
    ticks_per_year: u64,
) -> Result<(), EngineError> {
    let mut remaining = ticks;
    let mut year = 0_u64;
    while remaining > 0 {
        let slice = remaining.min(ticks_per_year);
        simulator.run(slice)?;
        remaining = remaining.saturating_sub(slice);
        year = year.saturating_add(1);

        let summary = Summary::of(simulator.get_population())
            .map_err(|source| EngineError::Summary { source })?;
        info!(
            year,
            date = ?simulator.clock().current_date(),
            rows = summary.rows,
            living = summary.living,
            mean_age = summary.mean_age,
            stroke_prevalence = summary.stroke_prevalence,
            "Year complete"
        );
    }
    Ok(())
}
