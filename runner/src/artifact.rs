pub mod yaml;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use yaml::YamlArtifact;

/// Peak finding result per event, length of the dataset is the event total
pub const PEAK_COUNTS: &str = "/entry_1/result_1/nPeaksAll";
/// Maps positions in the hit list to event numbers
pub const EVENT_TABLE: &str = "/LCLS/eventNumber";
/// Carries the peak finding thresholds as attributes
pub const PEAKS: &str = "/entry_1/result_1/nPeaks";
/// Bulk detector images
pub const PAYLOAD: &str = "/entry_1/instrument_1/detector_1/data";
/// Outcome of the conversion stage
pub const CONVERSION_STATUS: &str = "/status/xtc2cxidb";
/// Indexed peaks per event, written by the merge
pub const INDEXED_PEAKS: &str = "/entry_1/result_1/index";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to access result artifact {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Result artifact {path:?} is malformed")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Dataset {0} is missing from the result artifact")]
    MissingDataset(String),
    #[error("Dataset {dataset} has an unexpected shape: {reason}")]
    InvalidDataset { dataset: String, reason: String },
}

/// Peak finding thresholds a result artifact was produced with
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeakThresholds {
    #[serde(default)]
    pub min_peaks: i64,
    #[serde(default)]
    pub max_peaks: i64,
    #[serde(default)]
    pub min_res: i64,
}

/// The structured store holding per-event inputs and merged outputs
pub trait ResultStore {
    /// thresholds recorded by peak finding, `None` if never recorded
    fn thresholds(&self) -> Result<Option<PeakThresholds>, ArtifactError>;

    /// bulk payload is present and the conversion stage reported success
    fn has_payload(&self) -> Result<bool, ArtifactError>;

    /// per-event peak counts, one entry per event of the run
    fn peak_counts(&self) -> Result<Vec<i64>, ArtifactError>;

    /// event number of every hit, indexed by position in the hit list
    fn event_table(&self) -> Result<Vec<usize>, ArtifactError>;

    /// replace the indexed peak vector
    fn write_indexed_peaks(&self, peaks: &[i64]) -> Result<(), ArtifactError>;

    /// drop the bulk payload, no-op if already absent
    fn remove_payload(&self) -> Result<(), ArtifactError>;

    /// record the outcome of the conversion stage
    fn write_conversion_status(&self, status: &str) -> Result<(), ArtifactError>;
}

/// Whether an artifact already holds everything a run with `requested` would produce.
///
/// Missing or unreadable artifacts are simply not done.
pub fn is_complete<R: ResultStore>(store: &R, requested: &PeakThresholds) -> bool {
    matches!(store.has_payload(), Ok(true))
        && matches!(store.thresholds(), Ok(Some(used)) if used == *requested)
}

/// Number of events with at least `threshold` peaks
pub fn count_hits(peak_counts: &[i64], threshold: i64) -> usize {
    peak_counts.iter().filter(|&&count| count >= threshold).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits() {
        assert_eq!(count_hits(&[0, 15, 3, 40, 15], 15), 3);
        assert_eq!(count_hits(&[0, 1], 0), 2);
        assert_eq!(count_hits(&[], 10), 0);
    }
}
