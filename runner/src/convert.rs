use crate::{
    artifact::ResultStore,
    config::{ConversionConfig, IndexerConfig},
    job::{JobHandle, JobState},
    orchestrator::{cancel_outstanding, wait_for_jobs, OrchestratorError, RunOutcome, WaitResult},
    scheduler::{SchedulerClient, SubmitRequest},
    status::{StatusMessage, StatusRecord, StatusSink},
    sync::CancellationToken,
};
use tracing::{error, info, instrument, warn};

/// Converts raw run data into the result artifact before indexing
#[derive(Debug)]
pub struct ConversionStage<'a, S: SchedulerClient> {
    config: &'a IndexerConfig,
    conversion: &'a ConversionConfig,
    scheduler: &'a S,
}

impl<'a, S: SchedulerClient> ConversionStage<'a, S> {
    pub fn new(
        config: &'a IndexerConfig,
        conversion: &'a ConversionConfig,
        scheduler: &'a S,
    ) -> Self {
        Self {
            config,
            conversion,
            scheduler,
        }
    }

    pub fn command(&self) -> Vec<String> {
        let conversion = self.conversion;
        let thresholds = &self.config.thresholds;

        [
            "mpirun",
            conversion.exec.as_str(),
            "-e",
            self.config.experiment.as_str(),
            "-d",
            conversion.detector.as_str(),
            "-i",
        ]
        .into_iter()
        .map(str::to_owned)
        .chain([
            self.config.run_dir().to_string_lossy().into_owned(),
            "--sample".to_owned(),
            conversion.sample.clone(),
            "--instrument".to_owned(),
            conversion.instrument.clone(),
            "--pixelSize".to_owned(),
            conversion.pixel_size.to_string(),
            "--coffset".to_owned(),
            conversion.coffset.to_string(),
            "--clen".to_owned(),
            conversion.clen.clone(),
            "--minPeaks".to_owned(),
            thresholds.min_peaks.to_string(),
            "--maxPeaks".to_owned(),
            thresholds.max_peaks.to_string(),
            "--minRes".to_owned(),
            thresholds.min_res.to_string(),
            "--mode".to_owned(),
            "sfx".to_owned(),
            "--run".to_owned(),
            self.config.run.to_string(),
        ])
        .collect()
    }

    pub fn request(&self) -> SubmitRequest {
        SubmitRequest {
            command: self.command(),
            log_pattern: self.config.log_pattern(),
            slots: Some(self.conversion.processes.unwrap_or(self.config.cpus)),
            single_host: false,
        }
    }

    /// Run the conversion job to completion.
    ///
    /// Returns `None` when indexing may proceed, otherwise the outcome that
    /// ends the run.
    #[instrument(skip_all, level = "info")]
    pub fn run<R: ResultStore>(
        &self,
        store: &R,
        status: &StatusSink,
        token: &CancellationToken,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let request = self.request();
        let id = self
            .scheduler
            .submit(&request)
            .map_err(OrchestratorError::Conversion)?;
        let mut jobs = [JobHandle::new(id.clone(), request.log_for(&id))];
        info!(job = %id, "Submitted conversion job");

        let (result, passes) =
            wait_for_jobs(&mut jobs, self.scheduler, &self.config.poll, token, |_| {
                info!(job = %id, "Conversion hasn't finished yet");
            });

        let outcome = match (result, jobs[0].state) {
            (WaitResult::Finished, JobState::Succeeded) => {
                info!(passes, "Successfully done converting run {}", self.config.run);
                status.publish(&StatusRecord::message(StatusMessage::ConversionDone));

                if !matches!(store.has_payload(), Ok(true)) {
                    if let Err(error) = store.write_conversion_status("success") {
                        error!(error = ?error, "Couldn't record conversion status: {error}");
                    }
                }

                return Ok(None);
            }
            (WaitResult::Finished, JobState::NodeFailure) => {
                warn!("Conversion job node failure");
                status.publish(&StatusRecord::message(StatusMessage::NodeFailure));
                RunOutcome::NodeFailure
            }
            (WaitResult::Finished, _) => {
                warn!("Failed conversion attempt for run {}", self.config.run);
                status.publish(&StatusRecord::message(StatusMessage::ConversionFailed));
                RunOutcome::PartialOrJobFailure
            }
            (WaitResult::Cancelled, _) => RunOutcome::Cancelled,
            (WaitResult::Exhausted, _) => RunOutcome::Incomplete,
        };

        if matches!(outcome, RunOutcome::Cancelled | RunOutcome::Incomplete) {
            cancel_outstanding(&jobs, self.scheduler);
            status.publish(&StatusRecord::message(outcome.message()));
        }

        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::YamlArtifact,
        parse::{SUCCESS_SENTINEL, SUMMARY_SENTINEL},
        scheduler::{
            fake::{FakeReaction, FakeScheduler},
            SchedulerError,
        },
    };
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> IndexerConfig {
        let config: IndexerConfig = serde_yaml::from_str(&format!(
            r#"
experiment: cxic0415
run: 22
out_dir: {}
queue: psanaq
cpus: 12
thresholds: {{min_peaks: 15, max_peaks: 2048, min_res: 0}}
indexing:
  geometry: /calib/geom.geom
  peak_method: cxi
  integration_radius: "4,5,6"
  indexing_method: dirax
poll: {{interval_secs: 0, max_passes: 3}}
conversion:
  detector: DscCsPad
  sample: lysozyme
  instrument: CXI
  pixel_size: 0.00011
  clen: CXI:DS1:MMS:06.RBV
"#,
            dir.path().to_string_lossy()
        ))
        .unwrap();
        fs::create_dir_all(config.run_dir()).unwrap();

        config
    }

    #[test]
    fn builds_conversion_request() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let scheduler = FakeScheduler::new();
        let stage = ConversionStage::new(&config, config.conversion.as_ref().unwrap(), &scheduler);
        let request = stage.request();

        assert_eq!(request.slots, Some(12));
        assert_eq!(request.command[..4], ["mpirun", "xtc2cxidb", "-e", "cxic0415"]);
        assert_eq!(request.command[request.command.len() - 2..], ["--run", "22"]);
        assert!(request
            .command
            .windows(2)
            .any(|pair| pair == ["--minPeaks", "15"]));
    }

    #[test]
    fn successful_conversion_continues() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let artifact = YamlArtifact::new(config.artifact_path());
        let scheduler = FakeScheduler::new().with_hook({
            let artifact = artifact.path().to_path_buf();
            move |_, id, request| {
                fs::write(&artifact, "datasets:\n  /entry_1/instrument_1/detector_1/data: x\n").unwrap();
                fs::write(
                    request.log_for(id),
                    format!("{SUCCESS_SENTINEL}\n{SUMMARY_SENTINEL}\n"),
                )
                .unwrap();
                FakeReaction::Queue
            }
        });
        let status = StatusSink::new(config.status_path());
        let stage = ConversionStage::new(&config, config.conversion.as_ref().unwrap(), &scheduler);

        let outcome = stage
            .run(&artifact, &status, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, None);
        assert!(artifact.has_payload().unwrap());
        assert_eq!(
            status.read(),
            Some(StatusRecord::message(StatusMessage::ConversionDone))
        );
    }

    #[test]
    fn refused_submission_is_a_conversion_error() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let artifact = YamlArtifact::new(config.artifact_path());
        let scheduler = FakeScheduler::new().refusing_after(0);
        let status = StatusSink::new(config.status_path());
        let stage = ConversionStage::new(&config, config.conversion.as_ref().unwrap(), &scheduler);

        let error = stage
            .run(&artifact, &status, &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(
            error,
            OrchestratorError::Conversion(SchedulerError::SubmissionParse { .. })
        ));
        assert_eq!(error.to_string(), "Failed to submit conversion job");
    }

    #[test]
    fn node_failure_ends_run() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let artifact = YamlArtifact::new(config.artifact_path());
        let scheduler = FakeScheduler::new().with_hook(|_, _, _| FakeReaction::Exit);
        let status = StatusSink::new(config.status_path());
        let stage = ConversionStage::new(&config, config.conversion.as_ref().unwrap(), &scheduler);

        let outcome = stage
            .run(&artifact, &status, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, Some(RunOutcome::NodeFailure));
        assert_eq!(
            status.read(),
            Some(StatusRecord::message(StatusMessage::NodeFailure))
        );
    }

    #[test]
    fn exhausted_wait_cancels_job() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let artifact = YamlArtifact::new(config.artifact_path());
        let scheduler = FakeScheduler::new();
        let status = StatusSink::new(config.status_path());
        let stage = ConversionStage::new(&config, config.conversion.as_ref().unwrap(), &scheduler);

        let outcome = stage
            .run(&artifact, &status, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, Some(RunOutcome::Incomplete));
        assert_eq!(scheduler.cancelled().len(), 1);
        assert_eq!(scheduler.queries().len(), 3);
    }
}
