//! The simulation engine.
//!
//! A [`Simulator`] exclusively owns the population, the clock, the two
//! event trees (manipulation and accumulation), the seed configuration and
//! an optional worker pool. Each tick evaluates the manipulation tree,
//! then the accumulation tree, appends the staged rows with fresh ids and
//! advances the clock by one native unit.
//!
//! With a pool attached, every tick partitions the *current* population
//! into chunks, evaluates them on the pool, and merges them back before
//! the next tick starts. Without one, the tick runs in the calling thread
//! as worker 0.
//!
//! Each tick works on a copy of the stored population; the copy replaces
//! the stored value only once the tick has fully succeeded. A failing
//! tick therefore leaves the engine exactly as it was after the last
//! completed tick.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use microsim_types::{Population, PopulationError};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::{self, ChunkJob, ChunkOutcome, ClusterError, ClusterSpec, WorkerPool};
use crate::config::ConfigError;
use crate::error::SimError;
use crate::event::Event;
use crate::seeds::Seeds;
use crate::store;
use crate::tree::{EventNode, TickPass, evaluate_tick};

/// Per-event parameter vectors, keyed by event name.
pub type ParameterOverrides = BTreeMap<String, Vec<f64>>;

/// Pseudo event name used for failures while merging chunk results.
pub const MERGE_STAGE: &str = "merge";

/// Pseudo event name used for failures while reading the living mask at
/// the start of a tick.
pub const LIVING_STAGE: &str = "living_mask";

/// The manipulation and accumulation trees of an engine.
#[derive(Debug, Clone, Default)]
pub struct EventTrees {
    /// Events that transform existing rows; evaluated first each tick.
    pub manipulation: EventNode,
    /// Events that produce new rows; evaluated after the manipulation tree.
    pub accumulation: EventNode,
}

impl EventTrees {
    /// Every event of both trees in evaluation order.
    pub fn events(&self) -> Vec<&Event> {
        let mut events = self.manipulation.events();
        events.extend(self.accumulation.events());
        events
    }

    /// Find an event by name in either tree.
    pub fn find(&self, name: &str) -> Option<&Event> {
        self.manipulation
            .find(name)
            .or_else(|| self.accumulation.find(name))
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Event> {
        if self.manipulation.find(name).is_some() {
            self.manipulation.find_mut(name)
        } else {
            self.accumulation.find_mut(name)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        let names = self.manipulation.names().into_iter();
        for name in names.chain(self.accumulation.names()) {
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateEvent {
                    event: name.to_owned(),
                });
            }
        }
        for event in self.events() {
            event.check_parameters(event.parameters())?;
        }
        for (tree, node, manipulation) in [
            ("manipulation", &self.manipulation, true),
            ("accumulation", &self.accumulation, false),
        ] {
            if let Some(event) = node
                .events()
                .into_iter()
                .find(|event| event.is_manipulation() != manipulation)
            {
                let kind = if event.is_manipulation() {
                    "manipulation"
                } else {
                    "accumulation"
                };
                return Err(ConfigError::MisplacedEvent {
                    event: event.name().to_owned(),
                    kind: kind.to_owned(),
                    tree: tree.to_owned(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_overrides(
        &self,
        overrides: &ParameterOverrides,
    ) -> Result<(), ConfigError> {
        for (name, parameters) in overrides {
            let event = self.find(name).ok_or_else(|| ConfigError::UnknownEvent {
                event: name.clone(),
            })?;
            event.check_parameters(parameters)?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ParameterOverrides) -> Result<(), ConfigError> {
        self.check_overrides(overrides)?;
        for (name, parameters) in overrides {
            let event = self
                .find_mut(name)
                .ok_or_else(|| ConfigError::UnknownEvent {
                    event: name.clone(),
                })?;
            event.set_parameters(parameters.clone())?;
        }
        Ok(())
    }
}

/// A discrete-time microsimulation engine.
#[derive(Debug, Clone)]
pub struct Simulator {
    population: Population,
    clock: Clock,
    trees: EventTrees,
    seeds: Seeds,
    pool: Option<Arc<dyn WorkerPool>>,
    tick: u64,
}

impl Simulator {
    /// Build an engine from a population initializer and two event trees.
    ///
    /// Extra initializer arguments are captured by the closure.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Initializer`] if the initializer fails, and
    /// [`SimError::Config`] if the population lacks `id`/`alive`, event
    /// names repeat, an event sits in the wrong tree or violates its
    /// declared arity.
    pub fn new<I>(
        initializer: I,
        manipulation: impl Into<EventNode>,
        accumulation: impl Into<EventNode>,
        clock: Clock,
        seeds: impl Into<Seeds>,
    ) -> Result<Self, SimError>
    where
        I: FnOnce() -> anyhow::Result<Population>,
    {
        let population = initializer().map_err(|source| SimError::Initializer { source })?;
        Self::from_population(population, manipulation, accumulation, clock, seeds)
    }

    /// Build an engine from an already materialized population.
    ///
    /// # Errors
    ///
    /// Same validation as [`Simulator::new`].
    pub fn from_population(
        population: Population,
        manipulation: impl Into<EventNode>,
        accumulation: impl Into<EventNode>,
        clock: Clock,
        seeds: impl Into<Seeds>,
    ) -> Result<Self, SimError> {
        let population = store::prepare(population)?;
        let trees = EventTrees {
            manipulation: manipulation.into(),
            accumulation: accumulation.into(),
        };
        trees.validate()?;
        let seeds = seeds.into();
        seeds.validate_for(1)?;

        info!(
            rows = population.len(),
            columns = population.column_count(),
            events = trees.events().len(),
            unit = %clock.unit(),
            "simulator created"
        );

        Ok(Self {
            population,
            clock,
            trees,
            seeds,
            pool: None,
            tick: 0,
        })
    }

    /// Run `t_sim` ticks from the current state.
    ///
    /// # Errors
    ///
    /// Returns the first tick failure. Ticks completed before it are kept.
    pub fn run(&mut self, t_sim: u64) -> Result<(), SimError> {
        let start_tick = self.tick;
        info!(
            ticks = t_sim,
            start_tick,
            rows = self.population.len(),
            workers = self.workers(),
            "run started"
        );
        self.advance(t_sim)?;
        info!(
            end_tick = self.tick,
            rows = self.population.len(),
            elapsed = self.clock.elapsed(),
            "run finished"
        );
        Ok(())
    }

    /// Run `t_sim` ticks on a private copy of the engine with `overrides`
    /// applied and return `output` of the resulting population.
    ///
    /// `seeds` replaces the engine's seeds for the trial when given. The
    /// engine itself is never modified, so calls with equal arguments are
    /// bit-reproducible.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Config`] for unknown events, arity violations
    /// or seeds that cannot serve the attached pool, and any tick failure
    /// of the trial run.
    pub fn configure<T, F>(
        &self,
        t_sim: u64,
        overrides: &ParameterOverrides,
        seeds: Option<&Seeds>,
        output: F,
    ) -> Result<T, SimError>
    where
        F: FnOnce(&Population) -> T,
    {
        let mut trial = self.clone();
        trial.trees.apply_overrides(overrides)?;
        if let Some(seeds) = seeds {
            seeds.validate_for(trial.workers())?;
            trial.seeds = seeds.clone();
        }
        debug!(
            ticks = t_sim,
            overrides = overrides.len(),
            "configure trial started"
        );
        trial.advance(t_sim)?;
        Ok(output(&trial.population))
    }

    /// Permanently replace the parameters of the named events.
    ///
    /// Either every override is applied or none is.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Config`] for an unknown event or a vector that
    /// violates a declared arity.
    pub fn reconfigure(&mut self, overrides: &ParameterOverrides) -> Result<(), SimError> {
        self.trees.apply_overrides(overrides)?;
        info!(events = overrides.len(), "parameters reconfigured");
        Ok(())
    }

    /// The current population.
    pub const fn get_population(&self) -> &Population {
        &self.population
    }

    /// The current clock.
    pub const fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Both event trees.
    pub const fn trees(&self) -> &EventTrees {
        &self.trees
    }

    /// The seed configuration.
    pub const fn seeds(&self) -> &Seeds {
        &self.seeds
    }

    /// Number of ticks run so far.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Current parameters of every event.
    pub fn parameters(&self) -> ParameterOverrides {
        self.trees
            .events()
            .into_iter()
            .map(|event| (event.name().to_owned(), event.parameters().to_vec()))
            .collect()
    }

    /// Replace the seed configuration for future runs.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Config`] if the seeds cannot serve the attached
    /// pool.
    pub fn set_seeds(&mut self, seeds: impl Into<Seeds>) -> Result<(), SimError> {
        let seeds = seeds.into();
        seeds.validate_for(self.workers())?;
        self.seeds = seeds;
        Ok(())
    }

    /// Number of workers of the attached pool (1 when running serially).
    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |pool| pool.size())
    }

    /// Whether a worker pool is attached.
    pub const fn has_cluster(&self) -> bool {
        self.pool.is_some()
    }

    /// Start a worker pool and use it for every following tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Cluster`] if the pool cannot be started and
    /// [`SimError::Config`] if the seeds cannot serve its workers.
    pub fn start_cluster(&mut self, spec: &ClusterSpec) -> Result<(), SimError> {
        self.seeds.validate_for(spec.workers)?;
        let pool = spec.start()?;
        self.attach_pool(pool)
    }

    /// Use an existing worker pool for every following tick.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Cluster`] for an empty pool and
    /// [`SimError::Config`] if the seeds cannot serve its workers.
    pub fn attach_pool(&mut self, pool: Arc<dyn WorkerPool>) -> Result<(), SimError> {
        if pool.size() == 0 {
            return Err(ClusterError::NoWorkers.into());
        }
        self.seeds.validate_for(pool.size())?;
        info!(workers = pool.size(), backend = %pool.backend(), "cluster started");
        if let Some(previous) = self.pool.replace(pool) {
            warn!(workers = previous.size(), "replaced an active cluster");
        }
        Ok(())
    }

    /// Release the worker pool. Later ticks run serially. The population
    /// is not touched.
    pub fn stop_cluster(&mut self) {
        if let Some(pool) = self.pool.take() {
            info!(workers = pool.size(), "cluster stopped");
        }
    }

    /// Start a cluster that is released when the returned guard drops.
    ///
    /// # Errors
    ///
    /// Same as [`Simulator::start_cluster`].
    pub fn cluster(&mut self, spec: &ClusterSpec) -> Result<ClusterGuard<'_>, SimError> {
        self.start_cluster(spec)?;
        Ok(ClusterGuard { simulator: self })
    }

    /// Run `f` with a cluster attached, releasing it afterwards whether or
    /// not `f` succeeds.
    ///
    /// # Errors
    ///
    /// Returns cluster start failures and whatever `f` returns.
    pub fn with_cluster<T, F>(&mut self, spec: &ClusterSpec, f: F) -> Result<T, SimError>
    where
        F: FnOnce(&mut Self) -> Result<T, SimError>,
    {
        let guard = self.cluster(spec)?;
        f(&mut *guard.simulator)
    }

    fn advance(&mut self, t_sim: u64) -> Result<(), SimError> {
        for _ in 0..t_sim {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), SimError> {
        let tick = self.tick;
        let (mut population, mut born) = match self.pool.as_deref() {
            Some(pool) if !self.population.is_empty() => self.parallel_tick(pool, tick)?,
            _ => self.serial_tick(tick)?,
        };

        let added = born.len();
        if added > 0 {
            let first = store::next_id(&population).map_err(|e| merge_table_error(tick, e))?;
            store::assign_ids(&mut born, first).map_err(|e| merge_table_error(tick, e))?;
            population
                .append(born)
                .map_err(|source| SimError::Schema {
                    event: MERGE_STAGE.to_owned(),
                    tick,
                    source,
                })?;
        }

        self.population = population;
        self.clock.step();
        self.tick = tick.saturating_add(1);
        debug!(
            tick,
            rows = self.population.len(),
            living = self.population.alive_count().unwrap_or_default(),
            added,
            "tick complete"
        );
        Ok(())
    }

    fn serial_tick(&self, tick: u64) -> Result<(Population, Population), SimError> {
        let job = ChunkJob {
            index: 0,
            population: self.population.clone(),
            rng: self.seeds.stream(0, tick)?,
        };
        let outcome = evaluate_chunk(&self.trees, job, tick)?;
        Ok((outcome.population, outcome.accumulated))
    }

    fn parallel_tick(
        &self,
        pool: &dyn WorkerPool,
        tick: u64,
    ) -> Result<(Population, Population), SimError> {
        let living = self
            .population
            .living_mask()
            .map_err(|source| SimError::Table {
                event: LIVING_STAGE.to_owned(),
                tick,
                source,
            })?;

        let mut jobs = Vec::new();
        for (index, range) in cluster::partition(&living, pool.size())
            .into_iter()
            .enumerate()
        {
            if range.is_empty() {
                continue;
            }
            let population = self
                .population
                .slice(range)
                .map_err(|e| merge_table_error(tick, e))?;
            jobs.push(ChunkJob {
                index,
                population,
                rng: self.seeds.stream(index, tick)?,
            });
        }
        let chunks: Vec<usize> = jobs.iter().map(|job| job.index).collect();

        let trees = &self.trees;
        let results = pool.dispatch(jobs, &|job| evaluate_chunk(trees, job, tick));
        if results.len() != chunks.len() {
            return Err(ClusterError::LostChunks {
                sent: chunks.len(),
                received: results.len(),
            }
            .into());
        }

        let mut outcomes = Vec::with_capacity(chunks.len());
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    warn!(tick, chunk, error = %source, "worker failed, tick discarded");
                    return Err(ClusterError::WorkerFailed {
                        chunk,
                        source: Box::new(source),
                    }
                    .into());
                }
            }
        }

        cluster::merge(outcomes).map_err(|source| SimError::Schema {
            event: MERGE_STAGE.to_owned(),
            tick,
            source,
        })
    }
}

fn evaluate_chunk(trees: &EventTrees, job: ChunkJob, tick: u64) -> Result<ChunkOutcome, SimError> {
    let ChunkJob {
        index,
        population,
        mut rng,
    } = job;
    let mut pass = TickPass::new(population).map_err(|source| SimError::Table {
        event: LIVING_STAGE.to_owned(),
        tick,
        source,
    })?;
    evaluate_tick(&trees.manipulation, &mut pass, &mut rng, tick)?;
    evaluate_tick(&trees.accumulation, &mut pass, &mut rng, tick)?;
    Ok(ChunkOutcome {
        index,
        population: pass.population,
        accumulated: pass.staged,
    })
}

fn merge_table_error(tick: u64, source: PopulationError) -> SimError {
    SimError::Table {
        event: MERGE_STAGE.to_owned(),
        tick,
        source,
    }
}

/// Scoped cluster acquisition: the pool is released when the guard drops,
/// including on early return or panic.
#[derive(Debug)]
pub struct ClusterGuard<'a> {
    simulator: &'a mut Simulator,
}

impl Deref for ClusterGuard<'_> {
    type Target = Simulator;

    fn deref(&self) -> &Self::Target {
        self.simulator
    }
}

impl DerefMut for ClusterGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.simulator
    }
}

impl Drop for ClusterGuard<'_> {
    fn drop(&mut self) {
        self.simulator.stop_cluster();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::NaiveDate;
    use microsim_types::{ALIVE_COLUMN, Column, ID_COLUMN, LAST_EVENT_COLUMN};
    use rand::Rng;

    use super::*;
    use crate::cluster::{Backend, SerialPool};
    use crate::event::param;
    use crate::tree::EventGroup;

    fn clock() -> Clock {
        Clock::new("day", NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()).unwrap()
    }

    fn population(n: usize) -> Population {
        let ids: Vec<i64> = (1..=i64::try_from(n).unwrap()).collect();
        Population::from_columns([
            (ID_COLUMN, Column::from(ids)),
            (ALIVE_COLUMN, Column::from(vec![true; n])),
            ("age", Column::from(vec![50.0; n])),
        ])
        .unwrap()
    }

    fn aging() -> Event {
        Event::manipulation("aging", vec![1.0], |pop, living, params, _| {
            let step = param(params, 0)?;
            let mut next = pop.clone();
            for (row, age) in next.floats_mut("age")?.iter_mut().enumerate() {
                if living.is_alive(row) {
                    *age += step;
                }
            }
            Ok(next)
        })
        .with_arity(1)
    }

    fn mortality() -> Event {
        Event::manipulation("mortality", vec![0.0], |pop, living, params, rng| {
            let p = param(params, 0)?;
            let mut next = pop.clone();
            for (row, alive) in next.bools_mut(ALIVE_COLUMN)?.iter_mut().enumerate() {
                if living.is_alive(row) && rng.random_bool(p) {
                    *alive = false;
                }
            }
            Ok(next)
        })
        .with_arity(1)
    }

    fn births() -> Event {
        Event::accumulation("births", Vec::new(), |pop, _, _| {
            let mut rows = pop.slice(0..pop.len().min(1))?;
            rows.floats_mut("age")?.fill(0.0);
            Ok(rows)
        })
    }

    fn simulator(n: usize) -> Simulator {
        Simulator::from_population(
            population(n),
            EventGroup::ordered([mortality(), aging()]),
            births(),
            clock(),
            Seeds::Single(7),
        )
        .unwrap()
    }

    #[test]
    fn new_reports_initializer_failure() {
        let result = Simulator::new(
            || Err(anyhow::anyhow!("no input file")),
            EventNode::empty(),
            EventNode::empty(),
            clock(),
            Seeds::Single(1),
        );
        assert!(matches!(result, Err(SimError::Initializer { .. })));
    }

    #[test]
    fn new_rejects_duplicate_names_across_trees() {
        let births_named_aging =
            Event::accumulation("aging", Vec::new(), |pop, _, _| Ok(pop.empty_like()));
        let result = Simulator::from_population(
            population(2),
            aging(),
            births_named_aging,
            clock(),
            Seeds::Single(1),
        );
        assert!(matches!(
            result,
            Err(SimError::Config {
                source: ConfigError::DuplicateEvent { .. }
            })
        ));
    }

    #[test]
    fn new_rejects_misplaced_events() {
        let result = Simulator::from_population(
            population(2),
            births(),
            EventNode::empty(),
            clock(),
            Seeds::Single(1),
        );
        assert!(matches!(
            result,
            Err(SimError::Config {
                source: ConfigError::MisplacedEvent { .. }
            })
        ));
    }

    #[test]
    fn run_appends_births_with_fresh_ids() {
        let mut sim = simulator(3);
        sim.run(2).unwrap();
        let pop = sim.get_population();
        assert_eq!(pop.len(), 5);
        assert_eq!(pop.ints(ID_COLUMN).unwrap(), &[1, 2, 3, 4, 5]);
        // Newborns of tick 0 age once during tick 1, never during tick 0.
        assert_eq!(pop.floats("age").unwrap(), &[52.0, 52.0, 52.0, 1.0, 0.0]);
        assert_eq!(pop.texts(LAST_EVENT_COLUMN).unwrap()[4], "births");
        assert_eq!(sim.tick(), 2);
        assert_eq!(sim.clock().elapsed(), 2);
    }

    #[test]
    fn failed_tick_keeps_previous_state() {
        let flaky = Event::manipulation("flaky", Vec::new(), |pop, _, _, _| {
            if pop.floats("age")?.first().copied().unwrap_or_default() > 51.0 {
                anyhow::bail!("age out of table range");
            }
            Ok(pop.clone())
        });
        let mut sim = Simulator::from_population(
            population(2),
            EventGroup::ordered([aging(), flaky]),
            EventNode::empty(),
            clock(),
            Seeds::Single(1),
        )
        .unwrap();
        let err = sim.run(5).unwrap_err();
        assert_eq!(err.event(), Some("flaky"));
        assert_eq!(err.tick(), Some(1));
        assert_eq!(sim.tick(), 1);
        assert_eq!(sim.get_population().floats("age").unwrap(), &[51.0, 51.0]);
    }

    #[test]
    fn configure_leaves_engine_untouched() {
        let sim = simulator(4);
        let before = sim.get_population().clone();
        let overrides = ParameterOverrides::from([("aging".to_owned(), vec![2.0])]);
        let mean_age = sim
            .configure(3, &overrides, None, |pop| pop.mean("age").unwrap())
            .unwrap();
        assert!(mean_age.is_some());
        assert_eq!(sim.get_population(), &before);
        assert_eq!(sim.tick(), 0);
        assert_eq!(sim.parameters()["aging"], vec![1.0]);
    }

    #[test]
    fn configure_rejects_unknown_events() {
        let sim = simulator(1);
        let overrides = ParameterOverrides::from([("smoking".to_owned(), vec![0.1])]);
        let err = sim.configure(1, &overrides, None, |_| ()).unwrap_err();
        assert!(matches!(
            err,
            SimError::Config {
                source: ConfigError::UnknownEvent { .. }
            }
        ));
    }

    #[test]
    fn reconfigure_is_all_or_nothing() {
        let mut sim = simulator(1);
        let overrides = ParameterOverrides::from([
            ("aging".to_owned(), vec![3.0]),
            ("mortality".to_owned(), vec![0.1, 0.2]),
        ]);
        assert!(sim.reconfigure(&overrides).is_err());
        assert_eq!(sim.parameters()["aging"], vec![1.0]);

        let overrides = ParameterOverrides::from([("aging".to_owned(), vec![3.0])]);
        sim.reconfigure(&overrides).unwrap();
        assert_eq!(sim.parameters()["aging"], vec![3.0]);
    }

    #[test]
    fn one_worker_cluster_matches_serial_run() {
        let mut serial = simulator(20);
        serial
            .reconfigure(&ParameterOverrides::from([("mortality".to_owned(), vec![0.3])]))
            .unwrap();
        let mut clustered = serial.clone();
        serial.run(5).unwrap();
        clustered.attach_pool(Arc::new(SerialPool::new(1))).unwrap();
        clustered.run(5).unwrap();
        assert_eq!(serial.get_population(), clustered.get_population());
    }

    #[test]
    fn parallel_run_keeps_rows_in_order() {
        let mut sim = simulator(10);
        sim.attach_pool(Arc::new(SerialPool::new(3))).unwrap();
        sim.run(1).unwrap();
        let pop = sim.get_population();
        // One birth per chunk, appended after the existing rows.
        assert_eq!(pop.len(), 13);
        assert_eq!(
            pop.ints(ID_COLUMN).unwrap(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]
        );
    }

    #[test]
    fn worker_failure_names_chunk_and_event() {
        let picky = Event::manipulation("picky", Vec::new(), |pop, _, _, _| {
            if pop.ints(ID_COLUMN)?.contains(&9) {
                anyhow::bail!("row 9 is corrupt");
            }
            Ok(pop.clone())
        });
        let mut sim = Simulator::from_population(
            population(10),
            picky,
            EventNode::empty(),
            clock(),
            Seeds::Single(1),
        )
        .unwrap();
        sim.attach_pool(Arc::new(SerialPool::new(2))).unwrap();
        let err = sim.run(1).unwrap_err();
        assert!(matches!(
            err,
            SimError::Cluster {
                source: ClusterError::WorkerFailed { chunk: 1, .. }
            }
        ));
        assert_eq!(err.event(), Some("picky"));
        assert_eq!(err.tick(), Some(0));
        assert_eq!(sim.get_population().len(), 10);
    }

    #[test]
    fn with_cluster_releases_pool_on_error() {
        let mut sim = simulator(4);
        let spec = ClusterSpec {
            workers: 2,
            backend: Backend::Serial,
        };
        let result: Result<(), SimError> = sim.with_cluster(&spec, |sim| {
            assert!(sim.has_cluster());
            Err(ConfigError::UnknownEvent {
                event: "x".to_owned(),
            }
            .into())
        });
        assert!(result.is_err());
        assert!(!sim.has_cluster());
    }

    #[test]
    fn cluster_guard_releases_pool_on_early_return() {
        fn run_then_fail(sim: &mut Simulator) -> Result<(), SimError> {
            let mut cluster = sim.cluster(&ClusterSpec::threads(2))?;
            cluster.run(2)?;
            assert!(cluster.has_cluster());
            let bad = ParameterOverrides::from([("aging".to_owned(), vec![1.0, 2.0])]);
            cluster.reconfigure(&bad)?;
            Ok(())
        }

        let mut sim = simulator(8);
        let err = run_then_fail(&mut sim).unwrap_err();
        assert!(matches!(
            err,
            SimError::Config {
                source: ConfigError::ParameterCount { .. }
            }
        ));
        assert!(!sim.has_cluster());
        assert_eq!(sim.tick(), 2);
    }

    #[test]
    fn per_worker_seeds_must_cover_cluster() {
        let mut sim = simulator(4);
        sim.set_seeds(Seeds::PerWorker(vec![1, 2])).unwrap();
        let err = sim.start_cluster(&ClusterSpec::threads(3)).unwrap_err();
        assert!(matches!(
            err,
            SimError::Config {
                source: ConfigError::InvalidSeeds { .. }
            }
        ));
        assert!(!sim.has_cluster());
    }
}
