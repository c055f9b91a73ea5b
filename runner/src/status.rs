use crate::progress::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Failed to write status file {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize status record")]
    Serialize(#[from] serde_json::Error),
}

/// Terminal and milestone messages understood by supervisors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusMessage {
    /// artifact already satisfied the request, nothing was submitted
    #[serde(rename = "DoneCXIDB")]
    AlreadyDone,
    #[serde(rename = "#DoneCXIDB")]
    ConversionDone,
    #[serde(rename = "#FailedCXIDB")]
    ConversionFailed,
    #[serde(rename = "#FailedNode")]
    NodeFailure,
    #[serde(rename = "#StartIndexing")]
    StartIndexing,
    #[serde(rename = "#DoneIndexing")]
    IndexingDone,
    #[serde(rename = "#FailedIndexing")]
    IndexingFailed,
    #[serde(rename = "#Cancelled")]
    Cancelled,
    #[serde(rename = "#Incomplete")]
    Incomplete,
    /// a fatal error ended the run after it took the lease
    #[serde(rename = "#Aborted")]
    Aborted,
}

/// Record written to the status file, absent fields are omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_indexed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frac_done: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<StatusMessage>,
}

impl StatusRecord {
    pub fn message(message: StatusMessage) -> Self {
        Self {
            message: Some(message),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: StatusMessage) -> Self {
        self.message = Some(message);
        self
    }
}

impl From<&ProgressSnapshot> for StatusRecord {
    fn from(snapshot: &ProgressSnapshot) -> Self {
        Self {
            num_indexed: Some(snapshot.num_indexed),
            index_rate: Some(snapshot.index_rate_percent),
            frac_done: Some(snapshot.fraction_done_percent),
            message: None,
        }
    }
}

/// Progress file polled by supervisors, every write replaces the last one
#[derive(Debug, Clone)]
pub struct StatusSink {
    path: PathBuf,
}

impl StatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, record: &StatusRecord) -> Result<(), StatusError> {
        let content = serde_json::to_string(record)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");

        let io_error = |source| StatusError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&staging, content).map_err(io_error)?;
        fs::rename(&staging, &self.path).map_err(io_error)?;
        debug!(path = ?self.path, record = ?record, "Updated status");

        Ok(())
    }

    /// write and only log failures, a stale status never stops a run
    pub fn publish(&self, record: &StatusRecord) {
        if let Err(error) = self.write(record) {
            warn!(error = ?error, "Failed to publish status: {error}");
        }
    }

    pub fn read(&self) -> Option<StatusRecord> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
    }
}
