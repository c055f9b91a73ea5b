use crate::{
    job::{JobHandle, JobState},
    parse::summarize_log,
    scheduler::SchedulerClient,
};
use std::{fs, io::ErrorKind};
use tracing::{debug, info, instrument, warn};

/// Decides job states from scheduler logs, falling back to the scheduler's
/// own listing while a log is missing
#[derive(Debug)]
pub struct CompletionPoller<'a, S: SchedulerClient> {
    scheduler: &'a S,
}

impl<'a, S: SchedulerClient> CompletionPoller<'a, S> {
    pub fn new(scheduler: &'a S) -> Self {
        Self { scheduler }
    }

    /// Advance `job` and return its new state.
    ///
    /// Terminal states are sticky, polling them again touches neither the
    /// file system nor the scheduler.
    #[instrument(skip(self, job), fields(job = %job.id), level = "trace")]
    pub fn poll(&self, job: &mut JobHandle) -> JobState {
        if job.is_terminal() {
            return job.state;
        }

        match fs::read(&job.log) {
            Ok(bytes) => {
                job.missing_passes = 0;
                let summary = summarize_log(&String::from_utf8_lossy(&bytes));

                job.state = match (summary.finished, summary.succeeded) {
                    (true, true) => {
                        info!(log = ?job.log, "Job completed successfully");
                        JobState::Succeeded
                    }
                    (true, false) => {
                        warn!(log = ?job.log, "Job finished without success");
                        JobState::Failed
                    }
                    (false, _) => {
                        debug!(log = ?job.log, "Job hasn't finished yet");
                        JobState::Running
                    }
                };
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                job.missing_passes += 1;
                debug!(log = ?job.log, passes = job.missing_passes, "No such log yet");

                match self.scheduler.query_exited(&job.id) {
                    Ok(true) => {
                        warn!(log = ?job.log, "Node failure, job exited before writing its log");
                        job.state = JobState::NodeFailure;
                    }
                    Ok(false) => job.state = JobState::Running,
                    Err(error) => {
                        warn!(error = ?error, "Failed to query scheduler, retrying next pass: {error}");
                    }
                }
            }
            Err(error) => {
                warn!(log = ?job.log, error = ?error, "Failed to read job log, retrying next pass");
            }
        }

        job.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::JobId,
        parse::{SUCCESS_SENTINEL, SUMMARY_SENTINEL},
        scheduler::fake::FakeScheduler,
    };
    use tempfile::TempDir;

    fn job(dir: &TempDir, id: &str) -> JobHandle {
        JobHandle::new(JobId::from(id), dir.path().join(format!(".{id}.log")))
    }

    #[test]
    fn follows_log_to_success() {
        let dir = TempDir::new().unwrap();
        let scheduler = FakeScheduler::new();
        let poller = CompletionPoller::new(&scheduler);
        let mut job = job(&dir, "1000");

        assert_eq!(poller.poll(&mut job), JobState::Running);
        assert_eq!(job.missing_passes, 1);

        fs::write(&job.log, "Sender: LSF System\n").unwrap();
        assert_eq!(poller.poll(&mut job), JobState::Running);
        assert_eq!(job.missing_passes, 0);

        fs::write(
            &job.log,
            format!("Sender: LSF System\n{SUCCESS_SENTINEL}\n\n{SUMMARY_SENTINEL}\n"),
        )
        .unwrap();
        assert_eq!(poller.poll(&mut job), JobState::Succeeded);
    }

    #[test]
    fn summary_without_success_is_failure() {
        let dir = TempDir::new().unwrap();
        let scheduler = FakeScheduler::new();
        let poller = CompletionPoller::new(&scheduler);
        let mut job = job(&dir, "1000");

        fs::write(&job.log, format!("Exited with exit code 139.\n\n{SUMMARY_SENTINEL}\n")).unwrap();

        assert_eq!(poller.poll(&mut job), JobState::Failed);
    }

    #[test]
    fn missing_log_and_exited_job_is_node_failure() {
        let dir = TempDir::new().unwrap();
        let scheduler = FakeScheduler::new();
        let poller = CompletionPoller::new(&scheduler);
        let mut job = job(&dir, "1000");

        assert_eq!(poller.poll(&mut job), JobState::Running);
        scheduler.mark_exited(&job.id);
        assert_eq!(poller.poll(&mut job), JobState::NodeFailure);
        assert_eq!(scheduler.queries().len(), 2);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let dir = TempDir::new().unwrap();
        let scheduler = FakeScheduler::new();
        let poller = CompletionPoller::new(&scheduler);
        let mut job = job(&dir, "1000");
        scheduler.mark_exited(&job.id);

        assert_eq!(poller.poll(&mut job), JobState::NodeFailure);

        // a late log must not resurrect the job, nor trigger another query
        fs::write(
            &job.log,
            format!("{SUCCESS_SENTINEL}\n{SUMMARY_SENTINEL}\n"),
        )
        .unwrap();
        assert_eq!(poller.poll(&mut job), JobState::NodeFailure);
        assert_eq!(scheduler.queries().len(), 1);
    }
}
