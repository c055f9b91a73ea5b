use super::{parse_job_id, run_command, SchedulerClient, SchedulerError, SubmitRequest};
use crate::{
    config::{ConfigErrors, IndexerConfig},
    job::JobId,
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Client for IBM LSF driven through its command line tools
#[derive(Debug, Clone)]
pub struct LsfScheduler {
    pub queue: String,
    pub bsub: String,
    pub bjobs: String,
    pub bkill: String,
    pub timeout: Duration,
}

fn string_parameter(config: &IndexerConfig, key: &str, default: &str) -> Result<String, ConfigErrors> {
    match config.scheduler.parameter.get(key) {
        Some(value) => match value.as_str() {
            Some(value) => Ok(value.to_owned()),
            None => {
                warn!("scheduler.parameter.{key} must be a string");
                Err(ConfigErrors::InvalidParameter(format!("scheduler.parameter.{key}")))
            }
        },
        None => Ok(default.to_owned()),
    }
}

impl LsfScheduler {
    pub fn load(config: &IndexerConfig) -> Result<Self, ConfigErrors> {
        Ok(Self {
            queue: config.queue.clone(),
            bsub: string_parameter(config, "bsub", "bsub")?,
            bjobs: string_parameter(config, "bjobs", "bjobs")?,
            bkill: string_parameter(config, "bkill", "bkill")?,
            timeout: Duration::from_secs(config.poll.submit_timeout_secs),
        })
    }

    /// arguments handed to `bsub` for a request
    pub fn submit_args(&self, request: &SubmitRequest) -> Vec<String> {
        let mut args = vec!["-q".to_owned(), self.queue.clone()];

        if let Some(slots) = request.slots {
            args.push("-n".to_owned());
            args.push(slots.to_string());
        }
        if request.single_host {
            args.push("-R".to_owned());
            args.push("span[hosts=1]".to_owned());
        }

        args.push("-o".to_owned());
        args.push(request.log_pattern.to_string_lossy().into_owned());
        args.extend(request.command.iter().cloned());

        args
    }
}

/// Whether a `bjobs` listing reports `id` with status `EXIT`.
///
/// Rows look like `JOBID USER STAT QUEUE ...`, only exact id matches count.
pub fn listing_reports_exit(listing: &str, id: &JobId) -> bool {
    listing.lines().any(|line| {
        let mut columns = line.split_whitespace();

        columns.next() == Some(id.0.as_str()) && columns.nth(1) == Some("EXIT")
    })
}

impl SchedulerClient for LsfScheduler {
    #[instrument(skip(self, request), level = "debug")]
    fn submit(&self, request: &SubmitRequest) -> Result<JobId, SchedulerError> {
        let output = run_command(&self.bsub, &self.submit_args(request), self.timeout)?;
        let combined = output.combined();

        if !output.success {
            warn!(response = %combined.trim(), "bsub exited with a failure status");
        }

        let id = parse_job_id(&combined)?;
        info!(job = %id, queue = %self.queue, "Submitted batch job");

        Ok(id)
    }

    fn query_exited(&self, id: &JobId) -> Result<bool, SchedulerError> {
        let output = run_command(&self.bjobs, &["-d", id.0.as_str()], self.timeout)?;
        let exited = listing_reports_exit(&output.stdout, id);

        debug!(job = %id, exited, "Queried scheduler for job status");

        Ok(exited)
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        let output = run_command(&self.bkill, &[id.0.as_str()], self.timeout)?;

        if output.success {
            info!(job = %id, "Cancelled batch job");
        } else {
            // bkill refuses jobs that already finished
            debug!(job = %id, response = %output.combined().trim(), "bkill did not cancel job");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const LISTING: &str = "\
JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME
5121    xtal    DONE  psanaq     psana1101   psana1201   indexamajig Oct 19 10:02
51212   xtal    EXIT  psanaq     psana1101   psana1202   indexamajig Oct 19 10:02
5120    xtal    EXIT  psanaq     psana1101   psana1203   indexamajig Oct 19 10:01
";

    fn scheduler() -> LsfScheduler {
        LsfScheduler {
            queue: "psanaq".to_owned(),
            bsub: "bsub".to_owned(),
            bjobs: "bjobs".to_owned(),
            bkill: "bkill".to_owned(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn exit_requires_exact_id() {
        assert!(!listing_reports_exit(LISTING, &JobId::from("5121")));
        assert!(listing_reports_exit(LISTING, &JobId::from("51212")));
        assert!(listing_reports_exit(LISTING, &JobId::from("5120")));
        assert!(!listing_reports_exit(LISTING, &JobId::from("512")));
        assert!(!listing_reports_exit("", &JobId::from("5120")));
    }

    #[test]
    fn builds_bsub_arguments() {
        let request = SubmitRequest {
            command: vec!["indexamajig".to_owned(), "-j".to_owned(), "6".to_owned()],
            log_pattern: PathBuf::from("/run/r0022/.%J.log"),
            slots: None,
            single_host: true,
        };

        assert_eq!(
            scheduler().submit_args(&request),
            vec![
                "-q",
                "psanaq",
                "-R",
                "span[hosts=1]",
                "-o",
                "/run/r0022/.%J.log",
                "indexamajig",
                "-j",
                "6"
            ]
        );
    }

    #[test]
    fn reserves_slots() {
        let request = SubmitRequest {
            command: vec!["mpirun".to_owned()],
            log_pattern: PathBuf::from(".%J.log"),
            slots: Some(24),
            single_host: false,
        };

        assert_eq!(
            scheduler().submit_args(&request)[..4],
            ["-q", "psanaq", "-n", "24"]
        );
    }
}
