//! Worker pools, chunk partitioning and merging.
//!
//! A parallel tick splits the population into contiguous chunks, hands
//! each chunk (with the read-only event trees and its own random stream)
//! to a worker, and merges the results before the next tick may begin.
//!
//! Chunks are balanced on *living* rows: each chunk receives
//! `living / workers` living individuals and the trailing chunk absorbs
//! the remainder. Dead rows ride along inside whichever contiguous range
//! they fall in, so every row belongs to exactly one chunk and merging in
//! chunk order restores the original row order.
//!
//! The engine depends only on the [`WorkerPool`] trait; [`RayonPool`]
//! runs chunks on a dedicated thread pool and [`SerialPool`] runs them
//! one after another in the calling thread.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use microsim_types::{LivingMask, Population, SchemaError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::event::EventRng;

/// Errors raised by worker pools and parallel ticks.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A pool of zero workers was requested.
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// The backend could not start its workers.
    #[error("failed to start worker pool: {message}")]
    PoolBuild {
        /// Description of the failure.
        message: String,
    },

    /// The backend name is not recognized.
    #[error("unknown cluster backend `{backend}`")]
    UnknownBackend {
        /// The unrecognized name.
        backend: String,
    },

    /// A worker failed while evaluating its chunk; the tick was discarded.
    #[error("chunk {chunk} failed: {source}")]
    WorkerFailed {
        /// Index of the failing chunk.
        chunk: usize,
        /// The worker-side error.
        source: Box<SimError>,
    },

    /// The pool returned a different number of results than jobs sent.
    #[error("dispatched {sent} chunks but received {received} results")]
    LostChunks {
        /// Jobs dispatched.
        sent: usize,
        /// Results received.
        received: usize,
    },
}

/// Which [`WorkerPool`] implementation to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A dedicated rayon thread pool.
    #[default]
    Threads,
    /// In-thread sequential execution of chunks.
    Serial,
}

impl FromStr for Backend {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threads" | "thread" | "rayon" => Ok(Self::Threads),
            "serial" => Ok(Self::Serial),
            other => Err(ClusterError::UnknownBackend {
                backend: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threads => f.write_str("threads"),
            Self::Serial => f.write_str("serial"),
        }
    }
}

/// Request for a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Number of workers (and chunks per tick).
    pub workers: usize,
    /// Pool implementation.
    pub backend: Backend,
}

impl ClusterSpec {
    /// A thread-backed cluster of `workers` workers.
    pub const fn threads(workers: usize) -> Self {
        Self {
            workers,
            backend: Backend::Threads,
        }
    }

    /// Start the requested pool.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NoWorkers`] for a zero worker count and
    /// [`ClusterError::PoolBuild`] if the threads cannot be spawned.
    pub fn start(&self) -> Result<Arc<dyn WorkerPool>, ClusterError> {
        if self.workers == 0 {
            return Err(ClusterError::NoWorkers);
        }
        match self.backend {
            Backend::Threads => Ok(Arc::new(RayonPool::new(self.workers)?)),
            Backend::Serial => Ok(Arc::new(SerialPool::new(self.workers))),
        }
    }
}

/// One chunk of one tick, owned exclusively by the worker that runs it.
#[derive(Debug)]
pub struct ChunkJob {
    /// Chunk index, which is also the worker index of its random stream.
    pub index: usize,
    /// Rows of the chunk.
    pub population: Population,
    /// The chunk's random stream for this tick.
    pub rng: EventRng,
}

/// A chunk after evaluation.
#[derive(Debug)]
pub struct ChunkOutcome {
    /// Index of the originating chunk.
    pub index: usize,
    /// The chunk's rows after all manipulation events.
    pub population: Population,
    /// Rows accumulated by the chunk this tick.
    pub accumulated: Population,
}

/// Work executed for each chunk.
pub type ChunkTask<'a> = dyn Fn(ChunkJob) -> Result<ChunkOutcome, SimError> + Sync + 'a;

/// A pool of workers that evaluates chunks.
///
/// `dispatch` must return exactly one result per job, in job order, and
/// must not return before every job has finished.
pub trait WorkerPool: Send + Sync + fmt::Debug {
    /// Number of workers.
    fn size(&self) -> usize;

    /// Implementation behind this pool.
    fn backend(&self) -> Backend;

    /// Run `task` on every job.
    fn dispatch(
        &self,
        jobs: Vec<ChunkJob>,
        task: &ChunkTask<'_>,
    ) -> Vec<Result<ChunkOutcome, SimError>>;
}

/// Worker pool backed by a dedicated rayon thread pool.
#[derive(Debug)]
pub struct RayonPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl RayonPool {
    /// Spawn `size` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PoolBuild`] if the threads cannot be spawned.
    pub fn new(size: usize) -> Result<Self, ClusterError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("microsim-worker-{i}"))
            .build()
            .map_err(|e| ClusterError::PoolBuild {
                message: e.to_string(),
            })?;
        Ok(Self { pool, size })
    }
}

impl WorkerPool for RayonPool {
    fn size(&self) -> usize {
        self.size
    }

    fn backend(&self) -> Backend {
        Backend::Threads
    }

    fn dispatch(
        &self,
        jobs: Vec<ChunkJob>,
        task: &ChunkTask<'_>,
    ) -> Vec<Result<ChunkOutcome, SimError>> {
        self.pool.install(|| jobs.into_par_iter().map(task).collect())
    }
}

/// Worker pool that runs chunks sequentially in the calling thread.
///
/// Produces exactly the same results as [`RayonPool`] of the same size.
#[derive(Debug, Clone, Copy)]
pub struct SerialPool {
    size: usize,
}

impl SerialPool {
    /// A pool that partitions into `size` chunks.
    pub const fn new(size: usize) -> Self {
        Self { size }
    }
}

impl WorkerPool for SerialPool {
    fn size(&self) -> usize {
        self.size
    }

    fn backend(&self) -> Backend {
        Backend::Serial
    }

    fn dispatch(
        &self,
        jobs: Vec<ChunkJob>,
        task: &ChunkTask<'_>,
    ) -> Vec<Result<ChunkOutcome, SimError>> {
        jobs.into_iter().map(task).collect()
    }
}

/// Split rows into `chunks` contiguous ranges balanced on living rows.
///
/// Always returns exactly `max(chunks, 1)` ranges that together cover
/// `0..mask.len()` in order; some may be empty.
pub fn partition(mask: &LivingMask, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.max(1);
    let rows = mask.len();
    let living: Vec<usize> = mask.living_rows().collect();
    let per_chunk = living.len().checked_div(chunks).unwrap_or(0);

    let mut starts = Vec::with_capacity(chunks);
    starts.push(0);
    for k in 1..chunks {
        let nth_living = k.saturating_mul(per_chunk);
        starts.push(living.get(nth_living).copied().unwrap_or(rows));
    }

    let mut ranges = Vec::with_capacity(chunks);
    let mut iter = starts.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let end = iter.peek().copied().unwrap_or(rows);
        ranges.push(start..end);
    }
    ranges
}

/// Reassemble chunk outcomes: existing rows in chunk order, then every
/// chunk's accumulated rows in chunk order.
pub fn merge(mut outcomes: Vec<ChunkOutcome>) -> Result<(Population, Population), SchemaError> {
    outcomes.sort_by_key(|outcome| outcome.index);
    let (existing, accumulated): (Vec<_>, Vec<_>) = outcomes
        .into_iter()
        .map(|outcome| (outcome.population, outcome.accumulated))
        .unzip();
    Ok((Population::concat(existing)?, Population::concat(accumulated)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use microsim_types::{ALIVE_COLUMN, Column, ID_COLUMN};
    use rand::SeedableRng;

    use super::*;

    fn mask(flags: &[bool]) -> LivingMask {
        LivingMask::from(flags)
    }

    #[test]
    fn partition_balances_living_rows() {
        let ranges = partition(&mask(&[true; 10]), 4);
        assert_eq!(ranges, vec![0..2, 2..4, 4..6, 6..10]);
    }

    #[test]
    fn partition_keeps_dead_rows_in_place() {
        let flags = [true, false, false, true, true, false, true];
        let ranges = partition(&mask(&flags), 2);
        // Two living rows per chunk: rows 0 and 3 go to chunk 0, the
        // dead rows between them stay with it.
        assert_eq!(ranges, vec![0..4, 4..7]);
    }

    #[test]
    fn partition_covers_all_rows_when_few_are_alive() {
        let ranges = partition(&mask(&[false, true, false]), 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert_eq!(ranges.last().map(|r| r.end), Some(3));
        let covered: usize = ranges.iter().map(ExactSizeIterator::len).sum();
        assert_eq!(covered, 3);
    }

    #[test]
    fn partition_of_dead_population_is_one_chunk() {
        let ranges = partition(&mask(&[false, false]), 3);
        assert_eq!(ranges, vec![0..2, 2..2, 2..2]);
    }

    #[test]
    fn partition_with_zero_chunks_is_serial() {
        assert_eq!(partition(&mask(&[true, true]), 0), vec![0..2]);
    }

    fn table(ids: Vec<i64>) -> Population {
        let n = ids.len();
        Population::from_columns([
            (ID_COLUMN, Column::from(ids)),
            (ALIVE_COLUMN, Column::from(vec![true; n])),
        ])
        .unwrap()
    }

    #[test]
    fn merge_restores_chunk_order_and_appends_births_last() {
        let outcomes = vec![
            ChunkOutcome {
                index: 1,
                population: table(vec![3, 4]),
                accumulated: table(vec![100]),
            },
            ChunkOutcome {
                index: 0,
                population: table(vec![1, 2]),
                accumulated: table(vec![99]),
            },
        ];
        let (population, accumulated) = merge(outcomes).unwrap();
        assert_eq!(population.ints(ID_COLUMN).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(accumulated.ints(ID_COLUMN).unwrap(), &[99, 100]);
    }

    fn echo(job: ChunkJob) -> Result<ChunkOutcome, SimError> {
        let accumulated = job.population.empty_like();
        Ok(ChunkOutcome {
            index: job.index,
            population: job.population,
            accumulated,
        })
    }

    fn jobs() -> Vec<ChunkJob> {
        (0..3)
            .map(|index| ChunkJob {
                index,
                population: table(vec![i64::try_from(index).unwrap()]),
                rng: EventRng::seed_from_u64(0),
            })
            .collect()
    }

    #[test]
    fn pools_return_results_in_job_order() {
        let rayon_pool = ClusterSpec::threads(2).start().unwrap();
        let serial_pool = ClusterSpec {
            workers: 2,
            backend: Backend::Serial,
        }
        .start()
        .unwrap();
        for pool in [rayon_pool, serial_pool] {
            let results = pool.dispatch(jobs(), &echo);
            let indices: Vec<usize> = results.into_iter().map(|r| r.unwrap().index).collect();
            assert_eq!(indices, vec![0, 1, 2]);
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            ClusterSpec::threads(0).start(),
            Err(ClusterError::NoWorkers)
        ));
    }

    #[test]
    fn backend_parses_names() {
        assert_eq!("threads".parse::<Backend>().unwrap(), Backend::Threads);
        assert_eq!("Serial".parse::<Backend>().unwrap(), Backend::Serial);
        assert!("mpi".parse::<Backend>().is_err());
    }
}
