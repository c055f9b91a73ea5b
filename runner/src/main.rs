use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xtal_runner::{
    planner::plan, sync::cancel::register_signals, IndexerConfig, Orchestrator, ResultStore,
    Schedulers, YamlArtifact,
};

/// exit code for errors that stop a run before it produced an outcome
const FATAL: u8 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "xtal-index",
    version,
    about = "Index a crystallography run on a batch cluster and merge the results"
)]
struct Cli {
    /// YAML configuration of the run
    config: PathBuf,

    /// Override the experiment name
    #[arg(short, long)]
    experiment: Option<String>,

    /// Override the run number
    #[arg(short, long)]
    run: Option<u32>,

    /// Override the output directory
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Override the scheduler queue
    #[arg(long)]
    queue: Option<String>,

    /// Override the number of cpus the worker count is derived from
    #[arg(long)]
    cpus: Option<usize>,

    /// Keep the detector payload in the artifact after merging
    #[arg(long)]
    keep_data: bool,

    /// Give up after this many poll passes
    #[arg(long)]
    max_passes: Option<u64>,

    /// Print the chunk plan and exit without submitting
    #[arg(long)]
    dry_plan: bool,

    /// Increase verbosity, repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut IndexerConfig) {
        if let Some(ref experiment) = self.experiment {
            config.experiment = experiment.clone();
        }
        if let Some(run) = self.run {
            config.run = run;
        }
        if let Some(ref out_dir) = self.out_dir {
            config.out_dir = out_dir.clone();
        }
        if let Some(ref queue) = self.queue {
            config.queue = queue.clone();
        }
        if let Some(cpus) = self.cpus {
            config.cpus = cpus;
        }
        if self.keep_data {
            config.keep_data = true;
        }
        if self.max_passes.is_some() {
            config.poll.max_passes = self.max_passes;
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn dry_plan(config: &IndexerConfig, store: &YamlArtifact) -> ExitCode {
    let events = match store.event_table() {
        Ok(events) => events,
        Err(error) => {
            error!(error = ?error, "Cannot plan without the event table: {error}");
            return ExitCode::from(FATAL);
        }
    };

    match plan(events.len(), config.worker_count()) {
        Ok(chunks) => {
            for chunk in chunks {
                println!(
                    "{chunk}\t{} events\t{}",
                    chunk.len(),
                    config.chunk_stream_path(chunk.id).to_string_lossy()
                );
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("{error}");
            ExitCode::from(FATAL)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match IndexerConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(config = ?cli.config, error = ?error, "{error}");
            return ExitCode::from(FATAL);
        }
    };
    cli.apply(&mut config);

    if config.preflight_checks() {
        error!("Config contains errors, aborting");
        return ExitCode::from(FATAL);
    }

    let store = YamlArtifact::new(config.artifact_path());
    if cli.dry_plan {
        return dry_plan(&config, &store);
    }

    let scheduler = match Schedulers::load(&config) {
        Ok(scheduler) => scheduler,
        Err(error) => {
            error!(error = ?error, "{error}");
            return ExitCode::from(FATAL);
        }
    };
    let token = match register_signals() {
        Ok(token) => token,
        Err(error) => {
            error!(error = ?error, "Failed to register signal handlers: {error}");
            return ExitCode::from(FATAL);
        }
    };

    match Orchestrator::new(&config, &scheduler, &store, token).run() {
        Ok(report) => {
            info!(outcome = ?report.outcome, passes = report.state.passes, "Run finished");
            ExitCode::from(report.outcome.exit_code())
        }
        Err(error) => {
            error!(error = ?error, "Exiting after fatal error: {error}");
            ExitCode::from(FATAL)
        }
    }
}
