//! Splits a crystallography run into chunks, indexes them as batch jobs on a
//! cluster scheduler and merges the per-chunk streams back into the run's
//! result artifact.

pub mod artifact;
pub mod config;
pub mod convert;
pub mod job;
pub mod merge;
pub mod orchestrator;
pub mod parse;
pub mod planner;
pub mod poller;
pub mod progress;
pub mod scheduler;
pub mod status;
pub mod submit;
pub mod sync;

pub use artifact::{ResultStore, YamlArtifact};
pub use config::{ConfigErrors, IndexerConfig, MergePolicy};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome, RunReport};
pub use scheduler::{SchedulerClient, Schedulers};
pub use sync::CancellationToken;
