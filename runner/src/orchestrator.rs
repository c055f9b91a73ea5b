use crate::{
    artifact::{count_hits, is_complete, ArtifactError, ResultStore},
    config::{IndexerConfig, MergePolicy, PollConfig},
    convert::ConversionStage,
    job::{Job, JobHandle, JobState},
    merge::{MergeReport, ResultMerger},
    planner::{plan, PlanError},
    poller::CompletionPoller,
    progress::{ProgressAggregator, ProgressSnapshot},
    scheduler::{SchedulerClient, SchedulerError},
    status::{StatusMessage, StatusRecord, StatusSink},
    submit::{JobSubmitter, SubmitError},
    sync::{CancellationToken, Lease, LeaseError},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    borrow::{Borrow, BorrowMut},
    fs,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Longest uninterrupted sleep, keeps cancellation responsive
const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Failed to plan chunks")]
    Plan(#[from] PlanError),
    #[error("Failed to submit jobs")]
    Submit(#[from] SubmitError),
    #[error("Failed to open result artifact")]
    Artifact(#[from] ArtifactError),
    #[error("Failed to lease the run")]
    Lease(#[from] LeaseError),
    #[error("Failed to submit conversion job")]
    Conversion(#[source] SchedulerError),
    #[error("Failed to create run directory {path:?}")]
    RunDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Terminal classification of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    PartialOrJobFailure,
    NodeFailure,
    AlreadyDone,
    /// cancelled from outside, outstanding jobs were killed
    Cancelled,
    /// `max_passes` ran out before every job finished
    Incomplete,
}

impl RunOutcome {
    /// Classify finished jobs: any node failure dominates, then any
    /// application failure.
    pub fn classify<J: Borrow<JobHandle>>(jobs: &[J]) -> Self {
        let states = jobs
            .iter()
            .map(|job| Borrow::<JobHandle>::borrow(job).state)
            .collect_vec();

        if states.iter().all(|&state| state == JobState::Succeeded) {
            Self::Success
        } else if states.contains(&JobState::NodeFailure) {
            Self::NodeFailure
        } else {
            Self::PartialOrJobFailure
        }
    }

    /// terminal message published to the status sink
    pub fn message(self) -> StatusMessage {
        match self {
            Self::Success => StatusMessage::IndexingDone,
            Self::PartialOrJobFailure => StatusMessage::IndexingFailed,
            Self::NodeFailure => StatusMessage::NodeFailure,
            Self::AlreadyDone => StatusMessage::AlreadyDone,
            Self::Cancelled => StatusMessage::Cancelled,
            Self::Incomplete => StatusMessage::Incomplete,
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success | Self::AlreadyDone => 0,
            Self::PartialOrJobFailure => 1,
            Self::NodeFailure => 2,
            Self::Cancelled | Self::Incomplete => 3,
        }
    }
}

/// How a wait over a set of jobs ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Finished,
    Cancelled,
    Exhausted,
}

/// sleep for `duration`, returning early once the token is cancelled
fn sleep_unless_cancelled(duration: Duration, token: &CancellationToken) {
    let deadline = Instant::now() + duration;

    while !token.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Poll `jobs` pass by pass until all are terminal, the token is cancelled or
/// the pass budget runs out.
///
/// `on_pending` runs after every pass that left jobs unfinished, before the
/// pause. Returns the result together with the number of passes made.
pub fn wait_for_jobs<S, J, F>(
    jobs: &mut [J],
    scheduler: &S,
    poll: &PollConfig,
    token: &CancellationToken,
    mut on_pending: F,
) -> (WaitResult, u64)
where
    S: SchedulerClient,
    J: BorrowMut<JobHandle>,
    F: FnMut(&[J]),
{
    let poller = CompletionPoller::new(scheduler);
    let mut passes = 0;

    loop {
        if token.is_cancelled() {
            return (WaitResult::Cancelled, passes);
        }

        for job in jobs.iter_mut() {
            poller.poll(BorrowMut::<JobHandle>::borrow_mut(job));
        }
        passes += 1;

        let pending = jobs
            .iter()
            .filter(|job| !Borrow::<JobHandle>::borrow(*job).is_terminal())
            .count();
        if pending == 0 {
            return (WaitResult::Finished, passes);
        }

        debug!(pass = passes, pending, "Jobs haven't finished yet");
        on_pending(jobs);

        if poll.max_passes.map_or(false, |max| passes >= max) {
            return (WaitResult::Exhausted, passes);
        }

        sleep_unless_cancelled(poll.interval(), token);
    }
}

/// kill every job that has not reached a terminal state
pub fn cancel_outstanding<S, J>(jobs: &[J], scheduler: &S)
where
    S: SchedulerClient,
    J: Borrow<JobHandle>,
{
    for job in jobs.iter().map(Borrow::<JobHandle>::borrow) {
        if job.is_terminal() {
            continue;
        }

        if let Err(error) = scheduler.cancel(&job.id) {
            error!(job = %job.id, error = ?error, "Failed to cancel job, it may keep running: {error}");
        }
    }
}

/// Everything a single run owns, created at start and handed back at the end
#[derive(Debug, Default)]
pub struct OrchestrationState {
    pub jobs: Vec<Job>,
    pub passes: u64,
    pub last_snapshot: Option<ProgressSnapshot>,
}

impl OrchestrationState {
    fn streams(&self) -> Vec<PathBuf> {
        self.jobs.iter().map(|job| job.stream.clone()).collect()
    }
}

/// Result of a finished orchestration
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: OrchestrationState,
    pub merge: Option<MergeReport>,
}

impl RunReport {
    fn without_jobs(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            state: OrchestrationState::default(),
            merge: None,
        }
    }
}

/// Drives planning, submission, polling and finalization of one run
pub struct Orchestrator<'a, S: SchedulerClient, R: ResultStore> {
    config: &'a IndexerConfig,
    scheduler: &'a S,
    store: &'a R,
    status: StatusSink,
    token: CancellationToken,
}

impl<'a, S: SchedulerClient, R: ResultStore> Orchestrator<'a, S, R> {
    pub fn new(
        config: &'a IndexerConfig,
        scheduler: &'a S,
        store: &'a R,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            scheduler,
            store,
            status: StatusSink::new(config.status_path()),
            token,
        }
    }

    fn already_done(&self) -> bool {
        if is_complete(self.store, &self.config.thresholds) {
            info!("Data already exists, nothing to index");
            self.status
                .publish(&StatusRecord::message(StatusMessage::AlreadyDone));

            true
        } else {
            false
        }
    }

    #[instrument(skip(self), fields(experiment = %self.config.experiment, run = self.config.run), level = "info")]
    pub fn run(&self) -> Result<RunReport, OrchestratorError> {
        if self.already_done() {
            return Ok(RunReport::without_jobs(RunOutcome::AlreadyDone));
        }

        let run_dir = self.config.run_dir();
        fs::create_dir_all(&run_dir).map_err(|source| OrchestratorError::RunDir {
            path: run_dir.clone(),
            source,
        })?;
        let _lease = Lease::acquire(&self.config.lease_path())?;

        // another run may have finished between the first check and the lease
        if self.already_done() {
            return Ok(RunReport::without_jobs(RunOutcome::AlreadyDone));
        }

        let result = self.convert_and_index();
        if let Err(ref error) = result {
            error!(error = ?error, "Run aborted: {error}");
            self.status
                .publish(&StatusRecord::message(StatusMessage::Aborted));
        }

        result
    }

    /// conversion and indexing, run while the lease is held
    fn convert_and_index(&self) -> Result<RunReport, OrchestratorError> {
        if let Some(ref conversion) = self.config.conversion {
            let stage = ConversionStage::new(self.config, conversion, self.scheduler);

            if let Some(outcome) = stage.run(self.store, &self.status, &self.token)? {
                return Ok(RunReport::without_jobs(outcome));
            }
        }

        self.index()
    }

    fn index(&self) -> Result<RunReport, OrchestratorError> {
        info!("Start indexing");
        self.status
            .publish(&StatusRecord::message(StatusMessage::StartIndexing));

        let event_table = self.store.event_table()?;
        let peak_counts = self.store.peak_counts()?;
        let expected_hits = count_hits(&peak_counts, self.config.hit_threshold);
        let aggregator =
            ProgressAggregator::new(event_table.clone(), peak_counts.len(), expected_hits);

        let chunks = plan(event_table.len(), self.config.worker_count())?;
        info!(
            events = event_table.len(),
            chunks = chunks.len(),
            expected_hits,
            "Split run into chunks"
        );

        let mut state = OrchestrationState::default();
        let submitter = JobSubmitter::new(self.scheduler, self.config);
        for chunk in chunks.iter() {
            match submitter.submit(chunk) {
                Ok(job) => state.jobs.push(job),
                Err(error) => {
                    error!(error = ?error, "Submission failed, aborting run: {error}");
                    cancel_outstanding(&state.jobs, self.scheduler);

                    return Err(error.into());
                }
            }
        }

        let streams = state.streams();
        let mut last_snapshot = None;
        let (result, passes) = wait_for_jobs(
            &mut state.jobs,
            self.scheduler,
            &self.config.poll,
            &self.token,
            |jobs| {
                let snapshot = aggregator.snapshot(&streams);
                info!(
                    finished = jobs.iter().filter(|job| job.is_terminal()).count(),
                    indexed = snapshot.num_indexed,
                    processed = snapshot.num_processed,
                    index_rate = snapshot.index_rate_percent,
                    fraction_done = snapshot.fraction_done_percent,
                    "Indexing hasn't finished yet"
                );
                self.status.publish(&StatusRecord::from(&snapshot));
                last_snapshot = Some(snapshot);
            },
        );
        state.passes = passes;
        state.last_snapshot = last_snapshot;

        let outcome = match result {
            WaitResult::Finished => RunOutcome::classify(&state.jobs),
            WaitResult::Cancelled => RunOutcome::Cancelled,
            WaitResult::Exhausted => RunOutcome::Incomplete,
        };

        if matches!(outcome, RunOutcome::Cancelled | RunOutcome::Incomplete) {
            warn!(outcome = ?outcome, passes, "Stopping before all jobs finished");
            cancel_outstanding(&state.jobs, self.scheduler);
            self.publish_final(outcome, state.last_snapshot.as_ref());

            return Ok(RunReport {
                outcome,
                state,
                merge: None,
            });
        }

        let merge = self.finalize(outcome, &aggregator, &state);
        let snapshot = merge
            .as_ref()
            .map(|report| report.snapshot)
            .unwrap_or_else(|| aggregator.snapshot(&state.streams()));
        self.publish_final(outcome, Some(&snapshot));
        info!(outcome = ?outcome, passes, "Done indexing");

        Ok(RunReport {
            outcome,
            state,
            merge,
        })
    }

    fn finalize(
        &self,
        outcome: RunOutcome,
        aggregator: &ProgressAggregator,
        state: &OrchestrationState,
    ) -> Option<MergeReport> {
        if self.config.merge == MergePolicy::SuccessOnly && outcome != RunOutcome::Success {
            warn!(outcome = ?outcome, "Not merging unsuccessful run, chunk streams are kept");
            return None;
        }

        let merger = ResultMerger::new(
            self.store,
            aggregator,
            self.config.combined_stream_path(),
            self.config.keep_data,
        );

        match merger.finalize(&state.jobs) {
            Ok(report) => Some(report),
            Err(error) => {
                error!(error = ?error, "Failed to merge chunk streams: {error}");
                None
            }
        }
    }

    fn publish_final(&self, outcome: RunOutcome, snapshot: Option<&ProgressSnapshot>) {
        let record = snapshot
            .map(StatusRecord::from)
            .unwrap_or_default()
            .with_message(outcome.message());

        self.status.publish(&record);
    }
}
