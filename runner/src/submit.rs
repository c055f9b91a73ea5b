use crate::{
    config::IndexerConfig,
    job::Job,
    planner::Chunk,
    scheduler::{SchedulerClient, SchedulerError, SubmitRequest},
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to write work list {path:?}")]
    WorkList {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to submit chunk {chunk}")]
    Scheduler {
        chunk: usize,
        source: SchedulerError,
    },
}

/// Write one `<artifact> //<event>` line per work item of the chunk
pub fn write_work_list(path: &Path, artifact: &Path, chunk: &Chunk) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for event in chunk.indices() {
        writeln!(writer, "{} //{event}", artifact.to_string_lossy())?;
    }

    writer.flush()
}

/// Builds and issues one scheduler submission per chunk
#[derive(Debug)]
pub struct JobSubmitter<'a, S: SchedulerClient> {
    scheduler: &'a S,
    config: &'a IndexerConfig,
}

impl<'a, S: SchedulerClient> JobSubmitter<'a, S> {
    pub fn new(scheduler: &'a S, config: &'a IndexerConfig) -> Self {
        Self { scheduler, config }
    }

    /// indexer command line for a chunk, program first
    pub fn indexing_command(&self, chunk: &Chunk) -> Vec<String> {
        let indexing = &self.config.indexing;
        let path = |path: PathBuf| path.to_string_lossy().into_owned();

        let mut command = vec![
            indexing.exec.clone(),
            "-j".to_owned(),
            indexing.threads.to_string(),
            "-i".to_owned(),
            path(self.config.work_list_path(chunk.id)),
            "-g".to_owned(),
            path(indexing.geometry.clone()),
            format!("--peaks={}", indexing.peak_method),
            format!("--int-radius={}", indexing.integration_radius),
            format!("--indexing={}", indexing.indexing_method),
            "-o".to_owned(),
            path(self.config.chunk_stream_path(chunk.id)),
            format!("--temp-dir={}", path(self.config.run_dir())),
            format!("--tolerance={}", indexing.tolerance),
        ];

        if let Some(ref unit_cell) = indexing.unit_cell {
            command.push(format!("--pdb={}", unit_cell.to_string_lossy()));
        }
        if let Some(ref extra) = indexing.extra {
            command.extend(extra.split_whitespace().map(str::to_owned));
        }

        command
    }

    pub fn request(&self, chunk: &Chunk) -> SubmitRequest {
        SubmitRequest {
            command: self.indexing_command(chunk),
            log_pattern: self.config.log_pattern(),
            slots: None,
            single_host: true,
        }
    }

    #[instrument(skip(self, chunk), fields(chunk = chunk.id), level = "debug")]
    pub fn submit(&self, chunk: &Chunk) -> Result<Job, SubmitError> {
        let work_list = self.config.work_list_path(chunk.id);
        write_work_list(&work_list, &self.config.artifact_path(), chunk).map_err(|source| {
            SubmitError::WorkList {
                path: work_list.clone(),
                source,
            }
        })?;
        debug!(work_list = ?work_list, items = chunk.len(), "Wrote work list");

        let request = self.request(chunk);
        let id = self
            .scheduler
            .submit(&request)
            .map_err(|source| SubmitError::Scheduler {
                chunk: chunk.id,
                source,
            })?;
        let log = request.log_for(&id);

        info!(job = %id, log = ?log, "Submitted {chunk}");

        Ok(Job::new(
            *chunk,
            id,
            log,
            self.config.chunk_stream_path(chunk.id),
        ))
    }
}
