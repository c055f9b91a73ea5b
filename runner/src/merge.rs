use crate::{
    artifact::{ArtifactError, ResultStore},
    job::Job,
    orchestrator::RunOutcome,
    parse::parse_stream,
    progress::{IndexedPeaks, ProgressAggregator, ProgressSnapshot},
};
use itertools::Itertools;
use std::{
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Write},
    path::PathBuf,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Cannot merge while chunks {0:?} are still running")]
    JobsRunning(Vec<usize>),
    #[error("Failed to write combined stream {path:?}")]
    Combined { path: PathBuf, source: io::Error },
}

/// What finalization did, artifact problems are collected rather than raised
#[derive(Debug)]
pub struct MergeReport {
    pub outcome: RunOutcome,
    pub combined: PathBuf,
    pub indexed: IndexedPeaks,
    pub snapshot: ProgressSnapshot,
    /// chunks that never produced a stream
    pub missing_streams: Vec<usize>,
    pub artifact_errors: Vec<ArtifactError>,
}

/// Concatenates chunk streams and writes the indexed peaks into the artifact
#[derive(Debug)]
pub struct ResultMerger<'a, R: ResultStore> {
    store: &'a R,
    aggregator: &'a ProgressAggregator,
    combined: PathBuf,
    keep_payload: bool,
}

impl<'a, R: ResultStore> ResultMerger<'a, R> {
    pub fn new(
        store: &'a R,
        aggregator: &'a ProgressAggregator,
        combined: PathBuf,
        keep_payload: bool,
    ) -> Self {
        Self {
            store,
            aggregator,
            combined,
            keep_payload,
        }
    }

    /// Concatenate chunk streams strictly in chunk order
    fn concatenate(&self, jobs: &[&Job]) -> Result<Vec<usize>, MergeError> {
        let combined_error = |source| MergeError::Combined {
            path: self.combined.clone(),
            source,
        };
        let mut writer = BufWriter::new(File::create(&self.combined).map_err(combined_error)?);
        let mut missing = Vec::new();

        for job in jobs {
            match File::open(&job.stream) {
                Ok(mut stream) => {
                    let bytes = io::copy(&mut stream, &mut writer).map_err(combined_error)?;
                    debug!(stream = ?job.stream, bytes, "Appended chunk stream");
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    warn!(chunk = job.chunk.id, job = %job.id, "Chunk produced no stream");
                    missing.push(job.chunk.id);
                }
                Err(error) => {
                    warn!(chunk = job.chunk.id, error = ?error, "Failed to read chunk stream");
                    missing.push(job.chunk.id);
                }
            }
        }

        writer.flush().map_err(combined_error)?;

        Ok(missing)
    }

    /// Merge every finished job into the combined stream and the artifact.
    ///
    /// Once the combined stream exists the remaining steps are best effort:
    /// a failed artifact update is reported in the result but never rolls back
    /// the combined stream or the removal of chunk streams.
    #[instrument(skip_all, fields(combined = ?self.combined), level = "info")]
    pub fn finalize(&self, jobs: &[Job]) -> Result<MergeReport, MergeError> {
        let running = jobs
            .iter()
            .filter(|job| !job.is_terminal())
            .map(|job| job.chunk.id)
            .collect_vec();
        if !running.is_empty() {
            return Err(MergeError::JobsRunning(running));
        }

        let ordered = jobs.iter().sorted_by_key(|job| job.chunk.id).collect_vec();
        let missing_streams = self.concatenate(&ordered)?;

        let content = fs::read(&self.combined).map_err(|source| MergeError::Combined {
            path: self.combined.clone(),
            source,
        })?;
        let parsed = parse_stream(&String::from_utf8_lossy(&content));
        if parsed.incomplete {
            warn!("Combined stream ends with an unfinished record");
        }
        let indexed = self.aggregator.indexed_peaks(&parsed.records);
        let snapshot = indexed.snapshot(self.aggregator.expected_hits());

        let mut artifact_errors = Vec::new();
        if let Err(error) = self.store.write_indexed_peaks(&indexed.peaks) {
            error!(error = ?error, "Couldn't write indexed peaks to the artifact: {error}");
            artifact_errors.push(error);
        }
        if !self.keep_payload {
            if let Err(error) = self.store.remove_payload() {
                error!(error = ?error, "Couldn't remove payload from the artifact: {error}");
                artifact_errors.push(error);
            }
        }

        for job in ordered.iter().filter(|job| !missing_streams.contains(&job.chunk.id)) {
            if let Err(error) = fs::remove_file(&job.stream) {
                warn!(stream = ?job.stream, error = ?error, "Failed to clean up chunk stream");
            }
        }

        info!(
            indexed = snapshot.num_indexed,
            processed = snapshot.num_processed,
            "Merged {} chunk streams",
            ordered.len() - missing_streams.len()
        );

        Ok(MergeReport {
            outcome: RunOutcome::classify(jobs),
            combined: self.combined.clone(),
            indexed,
            snapshot,
            missing_streams,
            artifact_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::{YamlArtifact, INDEXED_PEAKS, PAYLOAD},
        job::{JobId, JobState},
        planner::plan,
    };
    use tempfile::TempDir;

    const ARTIFACT: &str = r#"
datasets:
  /entry_1/result_1/nPeaksAll: [20, 1, 30, 25, 0, 40]
  /LCLS/eventNumber: [0, 2, 3, 5]
  /entry_1/instrument_1/detector_1/data: "<frames>"
  /status/xtc2cxidb: success
"#;

    fn record(event: usize, indexed_by: &str, peaks: u64) -> String {
        format!("----- Begin chunk -----\nEvent: //{event}\nindexed_by = {indexed_by}\nnum_peaks = {peaks}\n----- End chunk -----\n")
    }

    struct Fixture {
        dir: TempDir,
        artifact: YamlArtifact,
        aggregator: ProgressAggregator,
        jobs: Vec<Job>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let artifact = YamlArtifact::new(dir.path().join("run.cxi"));
        fs::write(artifact.path(), ARTIFACT).unwrap();

        let jobs = plan(4, 2)
            .unwrap()
            .into_iter()
            .map(|chunk| {
                let mut job = Job::new(
                    chunk,
                    JobId(format!("{}", 10 + chunk.id)),
                    dir.path().join(format!(".{}.log", 10 + chunk.id)),
                    dir.path().join(format!("temp_{}.stream", chunk.id)),
                );
                job.state = JobState::Succeeded;
                job
            })
            .collect_vec();

        fs::write(
            &jobs[0].stream,
            record(0, "dirax", 20) + &record(1, "none", 1),
        )
        .unwrap();
        fs::write(
            &jobs[1].stream,
            record(2, "mosflm", 25) + &record(3, "dirax", 40),
        )
        .unwrap();

        Fixture {
            aggregator: ProgressAggregator::new(vec![0, 2, 3, 5], 6, 4),
            dir,
            artifact,
            jobs,
        }
    }

    #[test]
    fn merges_in_chunk_order() {
        let fixture = fixture();
        let combined = fixture.dir.path().join("run.stream");
        let merger = ResultMerger::new(&fixture.artifact, &fixture.aggregator, combined.clone(), false);
        let expected = fs::read_to_string(&fixture.jobs[0].stream).unwrap()
            + &fs::read_to_string(&fixture.jobs[1].stream).unwrap();

        let mut reversed = fixture.jobs.clone();
        reversed.reverse();
        let report = merger.finalize(&reversed).unwrap();

        assert_eq!(fs::read_to_string(&combined).unwrap(), expected);
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.indexed.peaks, vec![20, 0, 0, 25, 0, 40]);
        assert_eq!(report.snapshot.num_indexed, 3);
        assert_eq!(report.snapshot.num_processed, 4);
        assert!(report.artifact_errors.is_empty());
        assert!(fixture.jobs.iter().all(|job| !job.stream.exists()));

        let document = fixture.artifact.load().unwrap();
        assert_eq!(
            document.datasets[INDEXED_PEAKS],
            serde_yaml::from_str::<serde_yaml::Value>("[20, 0, 0, 25, 0, 40]").unwrap()
        );
        assert!(!document.datasets.contains_key(PAYLOAD));
    }

    #[test]
    fn keeps_payload_on_request() {
        let fixture = fixture();
        let merger = ResultMerger::new(
            &fixture.artifact,
            &fixture.aggregator,
            fixture.dir.path().join("run.stream"),
            true,
        );

        merger.finalize(&fixture.jobs).unwrap();

        assert!(fixture.artifact.load().unwrap().datasets.contains_key(PAYLOAD));
    }

    #[test]
    fn merges_around_missing_streams() {
        let mut fixture = fixture();
        fs::remove_file(&fixture.jobs[1].stream).unwrap();
        fixture.jobs[1].state = JobState::NodeFailure;
        let merger = ResultMerger::new(
            &fixture.artifact,
            &fixture.aggregator,
            fixture.dir.path().join("run.stream"),
            false,
        );

        let report = merger.finalize(&fixture.jobs).unwrap();

        assert_eq!(report.outcome, RunOutcome::NodeFailure);
        assert_eq!(report.missing_streams, vec![1]);
        assert_eq!(report.indexed.peaks, vec![20, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn reports_artifact_errors_without_rollback() {
        let fixture = fixture();
        fs::remove_file(fixture.artifact.path()).unwrap();
        let combined = fixture.dir.path().join("run.stream");
        let merger = ResultMerger::new(&fixture.artifact, &fixture.aggregator, combined.clone(), false);

        let report = merger.finalize(&fixture.jobs).unwrap();

        assert_eq!(report.artifact_errors.len(), 2);
        assert!(combined.exists());
        assert!(fixture.jobs.iter().all(|job| !job.stream.exists()));
    }

    #[test]
    fn refuses_running_jobs() {
        let mut fixture = fixture();
        fixture.jobs[0].state = JobState::Running;
        let merger = ResultMerger::new(
            &fixture.artifact,
            &fixture.aggregator,
            fixture.dir.path().join("run.stream"),
            false,
        );

        assert!(matches!(
            merger.finalize(&fixture.jobs),
            Err(MergeError::JobsRunning(chunks)) if chunks == vec![0]
        ));
        assert!(fixture.jobs[0].stream.exists());
    }
}
