use itertools::Itertools;
use std::{fmt, ops::Range};
use thiserror::Error;

/// Number of indexer threads a single chunk job is expected to occupy
pub const CPUS_PER_WORKER: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Cannot split {items} work items across {workers} workers")]
    InsufficientWorkItems { items: usize, workers: usize },
    #[error("At least one worker is required")]
    NoWorkers,
}

/// A contiguous range of event indices handled by exactly one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub id: usize,
    pub start: usize,
    /// inclusive upper bound
    pub end: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.end + 1
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} [{}..={}]", self.id, self.start, self.end)
    }
}

/// derive the number of chunk jobs from the cpu allocation of the run
pub fn workers_for_cpus(cpus: usize) -> usize {
    cpus / CPUS_PER_WORKER + 1
}

/// Split `items` work items into `workers` contiguous chunks.
///
/// Sizes differ by at most one, the larger chunks come first, e.g. 13 items on
/// 4 workers yields sizes `[4, 3, 3, 3]`.
pub fn plan(items: usize, workers: usize) -> Result<Vec<Chunk>, PlanError> {
    if workers == 0 {
        return Err(PlanError::NoWorkers);
    }

    if items < workers {
        return Err(PlanError::InsufficientWorkItems { items, workers });
    }

    let base = items / workers;
    let remainder = items % workers;

    Ok((0..workers)
        .scan(0, |start, id| {
            let size = base + usize::from(id < remainder);
            let chunk = Chunk {
                id,
                start: *start,
                end: *start + size - 1,
            };
            *start += size;

            Some(chunk)
        })
        .collect_vec())
}
