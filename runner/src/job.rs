use crate::planner::Chunk;
use serde::{Deserialize, Serialize};
use std::{
    borrow::{Borrow, BorrowMut},
    fmt,
    ops::{Deref, DerefMut},
    path::PathBuf,
};

/// Opaque identifier handed out by the cluster scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    NodeFailure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::NodeFailure)
    }
}

/// The part of a submission the poller observes
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    /// scheduler log, `<runDir>/.<jobId>.log`
    pub log: PathBuf,
    pub state: JobState,
    /// number of passes the log has been missing in a row
    pub missing_passes: u32,
}

impl JobHandle {
    pub fn new(id: JobId, log: PathBuf) -> Self {
        Self {
            id,
            log,
            state: JobState::Submitted,
            missing_passes: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Runtime binding of a chunk to a scheduler submission
#[derive(Debug, Clone)]
pub struct Job {
    pub chunk: Chunk,
    /// indexer output for this chunk
    pub stream: PathBuf,
    pub handle: JobHandle,
}

impl Job {
    pub fn new(chunk: Chunk, id: JobId, log: PathBuf, stream: PathBuf) -> Self {
        Self {
            chunk,
            stream,
            handle: JobHandle::new(id, log),
        }
    }
}

impl Deref for Job {
    type Target = JobHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl DerefMut for Job {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.handle
    }
}

impl Borrow<JobHandle> for Job {
    fn borrow(&self) -> &JobHandle {
        &self.handle
    }
}

impl BorrowMut<JobHandle> for Job {
    fn borrow_mut(&mut self) -> &mut JobHandle {
        &mut self.handle
    }
}
