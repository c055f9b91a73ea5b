use super::{
    ArtifactError, PeakThresholds, ResultStore, CONVERSION_STATUS, EVENT_TABLE, INDEXED_PEAKS,
    PAYLOAD, PEAKS, PEAK_COUNTS,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// In-file layout: datasets and their attributes keyed by hierarchical path
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactDocument {
    #[serde(default)]
    pub datasets: BTreeMap<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ArtifactDocument {
    fn dataset(&self, name: &str) -> Result<&Value, ArtifactError> {
        self.datasets
            .get(name)
            .ok_or_else(|| ArtifactError::MissingDataset(name.to_owned()))
    }

    fn integers(&self, name: &str) -> Result<Vec<i64>, ArtifactError> {
        let invalid = |reason: &str| ArtifactError::InvalidDataset {
            dataset: name.to_owned(),
            reason: reason.to_owned(),
        };

        self.dataset(name)?
            .as_sequence()
            .ok_or_else(|| invalid("expected a sequence"))?
            .iter()
            .map(|value| value.as_i64().ok_or_else(|| invalid("expected integers")))
            .collect()
    }
}

/// Result artifact stored as a single YAML document
#[derive(Debug, Clone)]
pub struct YamlArtifact {
    path: PathBuf,
}

impl YamlArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn load(&self) -> Result<ArtifactDocument, ArtifactError> {
        let content = fs::read_to_string(&self.path).map_err(|error| self.io_error(error))?;

        serde_yaml::from_str(&content).map_err(|source| ArtifactError::Yaml {
            path: self.path.clone(),
            source,
        })
    }

    /// replace the document, readers never observe a half written file
    pub fn save(&self, document: &ArtifactDocument) -> Result<(), ArtifactError> {
        let content = serde_yaml::to_string(document).map_err(|source| ArtifactError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");

        fs::write(&staging, content).map_err(|error| self.io_error(error))?;
        fs::rename(&staging, &self.path).map_err(|error| self.io_error(error))?;
        debug!(path = ?self.path, "Saved result artifact");

        Ok(())
    }

    fn update<F: FnOnce(&mut ArtifactDocument)>(&self, change: F) -> Result<(), ArtifactError> {
        let mut document = self.load()?;
        change(&mut document);

        self.save(&document)
    }
}

impl ResultStore for YamlArtifact {
    fn thresholds(&self) -> Result<Option<PeakThresholds>, ArtifactError> {
        let document = self.load()?;
        let Some(attributes) = document.attributes.get(PEAKS) else {
            return Ok(None);
        };
        let read = |key: &str| attributes.get(key).and_then(Value::as_i64);

        Ok(match (read("minPeaks"), read("maxPeaks"), read("minRes")) {
            (Some(min_peaks), Some(max_peaks), Some(min_res)) => Some(PeakThresholds {
                min_peaks,
                max_peaks,
                min_res,
            }),
            _ => None,
        })
    }

    fn has_payload(&self) -> Result<bool, ArtifactError> {
        let document = self.load()?;

        Ok(document.datasets.contains_key(PAYLOAD)
            && document.datasets.get(CONVERSION_STATUS).and_then(Value::as_str) == Some("success"))
    }

    fn peak_counts(&self) -> Result<Vec<i64>, ArtifactError> {
        self.load()?.integers(PEAK_COUNTS)
    }

    fn event_table(&self) -> Result<Vec<usize>, ArtifactError> {
        self.load()?
            .integers(EVENT_TABLE)?
            .into_iter()
            .map(|event| {
                usize::try_from(event).map_err(|_| ArtifactError::InvalidDataset {
                    dataset: EVENT_TABLE.to_owned(),
                    reason: format!("negative event number {event}"),
                })
            })
            .collect()
    }

    fn write_indexed_peaks(&self, peaks: &[i64]) -> Result<(), ArtifactError> {
        self.update(|document| {
            document.datasets.insert(
                INDEXED_PEAKS.to_owned(),
                Value::Sequence(peaks.iter().map(|&peaks| Value::from(peaks)).collect()),
            );
        })
    }

    fn remove_payload(&self) -> Result<(), ArtifactError> {
        self.update(|document| {
            document.datasets.remove(PAYLOAD);
            document.attributes.remove(PAYLOAD);
        })
    }

    fn write_conversion_status(&self, status: &str) -> Result<(), ArtifactError> {
        self.update(|document| {
            document
                .datasets
                .insert(CONVERSION_STATUS.to_owned(), Value::from(status));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::is_complete;
    use tempfile::TempDir;

    const DOCUMENT: &str = r#"
datasets:
  /entry_1/result_1/nPeaksAll: [3, 0, 25, 40]
  /LCLS/eventNumber: [0, 2, 3]
  /entry_1/instrument_1/detector_1/data: "<frames>"
  /status/xtc2cxidb: success
attributes:
  /entry_1/result_1/nPeaks:
    minPeaks: 15
    maxPeaks: 2048
    minRes: 0
"#;

    fn artifact(dir: &TempDir) -> YamlArtifact {
        let path = dir.path().join("cxic0415_0022.cxi");
        fs::write(&path, DOCUMENT).unwrap();

        YamlArtifact::new(path)
    }

    #[test]
    fn reads_datasets() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact(&dir);

        assert_eq!(artifact.peak_counts().unwrap(), vec![3, 0, 25, 40]);
        assert_eq!(artifact.event_table().unwrap(), vec![0, 2, 3]);
        assert!(artifact.has_payload().unwrap());
        assert_eq!(
            artifact.thresholds().unwrap(),
            Some(PeakThresholds {
                min_peaks: 15,
                max_peaks: 2048,
                min_res: 0
            })
        );
    }

    #[test]
    fn completeness_depends_on_thresholds_and_payload() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact(&dir);
        let used = PeakThresholds {
            min_peaks: 15,
            max_peaks: 2048,
            min_res: 0,
        };

        assert!(is_complete(&artifact, &used));
        assert!(!is_complete(
            &artifact,
            &PeakThresholds {
                min_peaks: 10,
                ..used
            }
        ));

        artifact.remove_payload().unwrap();
        assert!(!is_complete(&artifact, &used));
        assert!(!is_complete(&YamlArtifact::new(dir.path().join("missing.cxi")), &used));
    }

    #[test]
    fn overwrites_indexed_peaks() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact(&dir);

        artifact.write_indexed_peaks(&[1, 2, 3, 4]).unwrap();
        artifact.write_indexed_peaks(&[0, 57, 0, 0]).unwrap();

        let document = artifact.load().unwrap();
        assert_eq!(document.integers(INDEXED_PEAKS).unwrap(), vec![0, 57, 0, 0]);
        // untouched datasets survive the rewrite
        assert_eq!(document.integers(PEAK_COUNTS).unwrap(), vec![3, 0, 25, 40]);
    }

    #[test]
    fn reports_missing_datasets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.cxi");
        fs::write(&path, "datasets: {}\n").unwrap();
        let artifact = YamlArtifact::new(path);

        assert!(matches!(
            artifact.event_table(),
            Err(ArtifactError::MissingDataset(name)) if name == EVENT_TABLE
        ));
        assert_eq!(artifact.thresholds().unwrap(), None);
        assert!(!artifact.has_payload().unwrap());
    }
}
