pub mod fake;
pub mod lsf;

use crate::{
    config::{ConfigErrors, IndexerConfig},
    job::JobId,
};
use std::{
    ffi::OsStr,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to spawn scheduler command {command}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Scheduler command {command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("No job identifier found in submission response: {output:?}")]
    SubmissionParse { output: String },
    #[error("Failed to talk to the scheduler")]
    Io(#[from] std::io::Error),
}

/// Everything a scheduler needs to launch one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// payload command line, program first
    pub command: Vec<String>,
    /// log path pattern, the scheduler substitutes `%J` with the job id
    pub log_pattern: PathBuf,
    /// number of slots to reserve, scheduler default if absent
    pub slots: Option<usize>,
    /// keep all slots on a single host
    pub single_host: bool,
}

impl SubmitRequest {
    /// log path of a submitted job, the pattern with `%J` expanded
    pub fn log_for(&self, id: &JobId) -> PathBuf {
        PathBuf::from(
            self.log_pattern
                .to_string_lossy()
                .replace("%J", &id.0),
        )
    }
}

/// Minimal capability the orchestrator needs from a cluster scheduler
pub trait SchedulerClient {
    /// submit a job and return the identifier the scheduler assigned
    fn submit(&self, request: &SubmitRequest) -> Result<JobId, SchedulerError>;

    /// whether the scheduler itself reports the job as exited or aborted
    fn query_exited(&self, id: &JobId) -> Result<bool, SchedulerError>;

    /// kill a submitted job, finished jobs are ignored
    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError>;
}

/// All supported scheduler clients
/// These should be initialized from `Schedulers::load`
#[derive(Debug, Clone)]
pub enum Schedulers {
    Lsf(lsf::LsfScheduler),
}

impl Schedulers {
    pub fn load(config: &IndexerConfig) -> Result<Self, ConfigErrors> {
        match config.scheduler.name.to_lowercase().as_str() {
            "lsf" => Ok(Self::Lsf(lsf::LsfScheduler::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedScheduler(
                config.scheduler.name.clone(),
            )),
        }
    }
}

impl SchedulerClient for Schedulers {
    fn submit(&self, request: &SubmitRequest) -> Result<JobId, SchedulerError> {
        match self {
            Self::Lsf(client) => client.submit(request),
        }
    }

    fn query_exited(&self, id: &JobId) -> Result<bool, SchedulerError> {
        match self {
            Self::Lsf(client) => client.query_exited(id),
        }
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        match self {
            Self::Lsf(client) => client.cancel(id),
        }
    }
}

/// Extract the job identifier from a submission response.
///
/// Submission clients answer with a line like
/// `Job <12345> is submitted to queue <psanaq>.`, the first bracketed token
/// consisting only of digits is the identifier.
pub fn parse_job_id(output: &str) -> Result<JobId, SchedulerError> {
    output
        .split('<')
        .skip(1)
        .filter_map(|rest| rest.split_once('>').map(|(token, _)| token.trim()))
        .find(|token| !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit()))
        .map(JobId::from)
        .ok_or_else(|| SchedulerError::SubmissionParse {
            output: output.to_owned(),
        })
}

/// Output of a finished scheduler command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);

        combined
    }
}

/// run a short lived scheduler command and collect its output
pub fn run_command<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, SchedulerError> {
    let rendered = format!(
        "{program} {}",
        args.iter()
            .map(|arg| arg.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    debug!(command = %rendered, "Running scheduler command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SchedulerError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            // child hasn't exited yet
            child.kill()?;
            child.wait()?;

            return Err(SchedulerError::Timeout {
                command: rendered,
                timeout,
            });
        }
    };

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap_or_log()
        .read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap_or_log()
        .read_to_string(&mut stderr)?;

    trace!(status = ?status, stdout = %stdout, stderr = %stderr, "Scheduler command finished");

    Ok(CommandOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsf_response() {
        let id = parse_job_id("Job <482913> is submitted to queue <psanaq>.\n").unwrap();

        assert_eq!(id, JobId::from("482913"));
    }

    #[test]
    fn skips_non_numeric_tokens() {
        let id = parse_job_id("Warning <psanaq> is busy\nJob <77> is submitted").unwrap();

        assert_eq!(id.0, "77");
    }

    #[test]
    fn rejects_refused_submission() {
        let error = parse_job_id("Bad resource requirement syntax. Job not submitted.\n")
            .unwrap_err();

        assert!(matches!(error, SchedulerError::SubmissionParse { .. }));
        assert!(parse_job_id("Job <> is submitted").is_err());
        assert!(parse_job_id("Job <12").is_err());
    }

    #[test]
    fn expands_log_pattern() {
        let request = SubmitRequest {
            command: Vec::new(),
            log_pattern: PathBuf::from("/data/r0007/.%J.log"),
            slots: None,
            single_host: false,
        };

        assert_eq!(
            request.log_for(&JobId::from("991")),
            PathBuf::from("/data/r0007/.991.log")
        );
    }

    #[test]
    fn runs_commands() {
        let output = run_command("sh", &["-c", "echo out; echo err >&2"], Duration::from_secs(5))
            .unwrap();

        assert!(output.success);
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[test]
    fn kills_slow_commands() {
        let error = run_command("sleep", &["5"], Duration::from_millis(100)).unwrap_err();

        assert!(matches!(error, SchedulerError::Timeout { .. }));
    }
}
