use crate::{artifact::PeakThresholds, planner::workers_for_cpus};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Read(#[from] std::io::Error),
    #[error("Config file is malformed")]
    Parse(#[from] serde_yaml::Error),
    #[error("Scheduler not supported: {0}")]
    UnsupportedScheduler(String),
    #[error("Invalid parameter {0}")]
    InvalidParameter(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IndexerConfig {
    pub experiment: String,
    pub run: u32,
    pub out_dir: PathBuf,
    pub queue: String,
    #[serde(default = "default_cpus")]
    pub cpus: usize,
    // derived from cpus when absent
    pub workers: Option<usize>,
    // events with fewer peaks are not counted as hits
    #[serde(default)]
    pub hit_threshold: i64,
    // keep the bulk detector payload in the artifact after merging
    #[serde(default)]
    pub keep_data: bool,
    #[serde(default)]
    pub thresholds: PeakThresholds,
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub merge: MergePolicy,
    pub artifact: Option<PathBuf>,
    pub status: Option<PathBuf>,
    pub conversion: Option<ConversionConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct IndexingConfig {
    #[serde(default = "default_indexer")]
    pub exec: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    pub geometry: PathBuf,
    pub peak_method: String,
    pub integration_radius: String,
    pub indexing_method: String,
    #[serde(default = "default_tolerance")]
    pub tolerance: String,
    pub unit_cell: Option<PathBuf>,
    // appended verbatim, split on whitespace
    pub extra: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // Name of the selected scheduler, see Schedulers::load for the selection proccess
    #[serde(default = "default_scheduler")]
    pub name: String,
    // scheduler specific parameters, e.g. paths to the client tools
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler(),
            parameter: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    // unbounded when absent
    pub max_passes: Option<u64>,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_passes: None,
            submit_timeout_secs: default_submit_timeout(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// When chunk streams get merged into the artifact
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// merge whatever exists once every job finished, failures included
    #[default]
    Always,
    /// merge only if every chunk succeeded, keep chunk streams otherwise
    SuccessOnly,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConversionConfig {
    #[serde(default = "default_converter")]
    pub exec: String,
    pub detector: String,
    pub sample: String,
    pub instrument: String,
    pub pixel_size: f64,
    #[serde(default)]
    pub coffset: f64,
    pub clen: String,
    // defaults to cpus
    pub processes: Option<usize>,
}

impl IndexerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.out_dir.join(format!("r{:04}", self.run))
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.artifact.clone().unwrap_or_else(|| {
            self.run_dir()
                .join(format!("{}_{:04}.cxi", self.experiment, self.run))
        })
    }

    pub fn status_path(&self) -> PathBuf {
        self.status
            .clone()
            .unwrap_or_else(|| self.run_dir().join("status_index.txt"))
    }

    pub fn combined_stream_path(&self) -> PathBuf {
        self.run_dir()
            .join(format!("{}_{}.stream", self.experiment, self.run))
    }

    fn chunk_file(&self, chunk: usize, extension: &str) -> PathBuf {
        self.run_dir().join(format!(
            "temp_{}_{}_{chunk}.{extension}",
            self.experiment, self.run
        ))
    }

    pub fn work_list_path(&self, chunk: usize) -> PathBuf {
        self.chunk_file(chunk, "lst")
    }

    pub fn chunk_stream_path(&self, chunk: usize) -> PathBuf {
        self.chunk_file(chunk, "stream")
    }

    pub fn lease_path(&self) -> PathBuf {
        self.run_dir().join(".index.lease")
    }

    /// scheduler log pattern, `%J` is replaced by the job id
    pub fn log_pattern(&self) -> PathBuf {
        self.run_dir().join(".%J.log")
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| workers_for_cpus(self.cpus))
    }

    /// Validate the config, reporting every problem instead of only the first.
    ///
    /// Returns true if the config contains errors.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.experiment.trim().is_empty() {
            error!("experiment must not be empty");
            contains_error = true;
        }

        if self.queue.trim().is_empty() {
            error!("queue must not be empty");
            contains_error = true;
        }

        if self.cpus == 0 {
            error!("cpus cannot be 0");
            contains_error = true;
        }

        if self.workers == Some(0) {
            error!("workers cannot be 0, remove it to derive the worker count from cpus");
            contains_error = true;
        }

        if self.indexing.threads == 0 {
            error!("indexing.threads cannot be 0");
            contains_error = true;
        }

        if self.poll.interval_secs == 0 {
            warn!("poll.interval_secs is 0, the scheduler will be queried without pause");
        }

        if self.poll.submit_timeout_secs == 0 {
            error!("poll.submit_timeout_secs cannot be 0");
            contains_error = true;
        }

        if self.poll.max_passes == Some(0) {
            error!("poll.max_passes cannot be 0, remove it to wait without limit");
            contains_error = true;
        }

        if self.thresholds.min_peaks > self.thresholds.max_peaks {
            error!(
                "thresholds.min_peaks ({}) is larger than thresholds.max_peaks ({})",
                self.thresholds.min_peaks, self.thresholds.max_peaks
            );
            contains_error = true;
        }

        if !self.indexing.geometry.is_file() {
            error!(
                "Failed to find indexing.geometry. Either not a file or not found at {}",
                self.indexing.geometry.to_string_lossy()
            );
            contains_error = true;
        }

        if let Some(ref unit_cell) = self.indexing.unit_cell {
            if !unit_cell.is_file() {
                error!(
                    "Failed to find indexing.unit_cell. Either not a file or not found at {}",
                    unit_cell.to_string_lossy()
                );
                contains_error = true;
            }
        }

        for (name, value) in [
            ("indexing.peak_method", &self.indexing.peak_method),
            ("indexing.integration_radius", &self.indexing.integration_radius),
            ("indexing.indexing_method", &self.indexing.indexing_method),
        ] {
            if value.trim().is_empty() {
                error!("{name} must not be empty");
                contains_error = true;
            }
        }

        if let Some(ref conversion) = self.conversion {
            if conversion.processes == Some(0) {
                error!("conversion.processes cannot be 0");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_cpus() -> usize {
    24
}

fn default_indexer() -> String {
    "indexamajig".to_owned()
}

fn default_converter() -> String {
    "xtc2cxidb".to_owned()
}

fn default_threads() -> usize {
    6
}

fn default_tolerance() -> String {
    "5,5,5,1.5".to_owned()
}

fn default_scheduler() -> String {
    "lsf".to_owned()
}

fn default_interval() -> u64 {
    10
}

fn default_submit_timeout() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
experiment: cxic0415
run: 22
out_dir: /reg/d/psdm/cxi/cxic0415/scratch
queue: psanaq
thresholds:
  min_peaks: 15
  max_peaks: 2048
  min_res: 0
indexing:
  geometry: /reg/d/psdm/cxi/cxic0415/calib/geom.geom
  peak_method: cxi
  integration_radius: "4,5,6"
  indexing_method: mosflm-noretry,dirax
scheduler:
  name: lsf
  parameter:
    bsub: /usr/bin/bsub
merge: success-only
"#;

    #[test]
    fn applies_defaults() {
        let config: IndexerConfig = serde_yaml::from_str(CONFIG).unwrap();

        assert_eq!(config.cpus, 24);
        assert_eq!(config.worker_count(), 5);
        assert_eq!(config.indexing.exec, "indexamajig");
        assert_eq!(config.indexing.threads, 6);
        assert_eq!(config.indexing.tolerance, "5,5,5,1.5");
        assert_eq!(config.poll, PollConfig::default());
        assert_eq!(config.merge, MergePolicy::SuccessOnly);
        assert!(!config.keep_data);
        assert!(config.conversion.is_none());
    }

    #[test]
    fn derives_paths() {
        let config: IndexerConfig = serde_yaml::from_str(CONFIG).unwrap();
        let run_dir = PathBuf::from("/reg/d/psdm/cxi/cxic0415/scratch/r0022");

        assert_eq!(config.run_dir(), run_dir);
        assert_eq!(config.artifact_path(), run_dir.join("cxic0415_0022.cxi"));
        assert_eq!(config.status_path(), run_dir.join("status_index.txt"));
        assert_eq!(config.combined_stream_path(), run_dir.join("cxic0415_22.stream"));
        assert_eq!(config.work_list_path(3), run_dir.join("temp_cxic0415_22_3.lst"));
        assert_eq!(
            config.chunk_stream_path(0),
            run_dir.join("temp_cxic0415_22_0.stream")
        );
        assert_eq!(config.log_pattern(), run_dir.join(".%J.log"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let broken = format!("{CONFIG}verbose: true\n");

        assert!(serde_yaml::from_str::<IndexerConfig>(&broken).is_err());
    }

    #[test]
    fn preflight_reports_problems() {
        let dir = TempDir::new().unwrap();
        let geometry = dir.path().join("geom.geom");
        fs::write(&geometry, "clen = 0.1\n").unwrap();

        let mut config: IndexerConfig = serde_yaml::from_str(CONFIG).unwrap();
        assert!(config.preflight_checks(), "geometry does not exist");

        config.indexing.geometry = geometry;
        assert!(!config.preflight_checks());

        config.thresholds.min_peaks = 4096;
        assert!(config.preflight_checks());
    }
}
