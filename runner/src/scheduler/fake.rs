use super::{SchedulerClient, SchedulerError, SubmitRequest};
use crate::job::JobId;
use parking_lot::Mutex;
use std::{collections::BTreeSet, fmt};

/// What the fake cluster does with a freshly submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeReaction {
    /// leave the job alone, it is neither listed as exited nor cancelled
    Queue,
    /// report the job as `EXIT` in the status listing
    Exit,
}

type SubmitHook = Box<dyn Fn(usize, &JobId, &SubmitRequest) -> FakeReaction + Send + Sync>;

/// In-memory scheduler used to drive the orchestrator without a cluster.
///
/// Ids are handed out sequentially starting at 1000. The optional hook runs on
/// every submission with the submission index and may produce the job's files.
#[derive(Default)]
pub struct FakeScheduler {
    submissions: Mutex<Vec<(JobId, SubmitRequest)>>,
    exited: Mutex<BTreeSet<JobId>>,
    cancelled: Mutex<Vec<JobId>>,
    queries: Mutex<Vec<JobId>>,
    refuse_after: Option<usize>,
    hook: Option<SubmitHook>,
}

impl fmt::Debug for FakeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeScheduler")
            .field("submissions", &self.submissions.lock().len())
            .field("exited", &*self.exited.lock())
            .field("refuse_after", &self.refuse_after)
            .finish()
    }
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, &JobId, &SubmitRequest) -> FakeReaction + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// answer submissions after the first `count` without a job id
    pub fn refusing_after(mut self, count: usize) -> Self {
        self.refuse_after = Some(count);
        self
    }

    pub fn mark_exited(&self, id: &JobId) {
        self.exited.lock().insert(id.clone());
    }

    pub fn submissions(&self) -> Vec<(JobId, SubmitRequest)> {
        self.submissions.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }

    pub fn queries(&self) -> Vec<JobId> {
        self.queries.lock().clone()
    }
}

impl SchedulerClient for FakeScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<JobId, SchedulerError> {
        let mut submissions = self.submissions.lock();
        let index = submissions.len();

        if self.refuse_after.map_or(false, |count| index >= count) {
            return Err(SchedulerError::SubmissionParse {
                output: "Request aborted by esub. Job not submitted.".to_owned(),
            });
        }

        let id = JobId(format!("{}", 1000 + index));
        submissions.push((id.clone(), request.clone()));
        drop(submissions);

        if let Some(hook) = &self.hook {
            if hook(index, &id, request) == FakeReaction::Exit {
                self.mark_exited(&id);
            }
        }

        Ok(id)
    }

    fn query_exited(&self, id: &JobId) -> Result<bool, SchedulerError> {
        self.queries.lock().push(id.clone());

        Ok(self.exited.lock().contains(id))
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        self.cancelled.lock().push(id.clone());

        Ok(())
    }
}
