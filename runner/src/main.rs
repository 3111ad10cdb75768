mod abort;
mod collector;
mod config;
mod evolve;
mod executors;
mod experiment;
mod resources;
mod scheduler;
mod sentinel;
mod sync;

use crate::{
    abort::AbortError,
    collector::Collector,
    config::{ConfigErrors, SchedulerOptions},
    evolve::{EvolutionSource, EvolveError},
    experiment::{Blueprint, CleanOptions, ExperimentError},
    scheduler::{Scheduler, SchedulerError, SessionReport},
    sync::session::SessionId,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_yaml::{Mapping, Value};
use sortie_genetics::phenotype::deep_merge;
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser)]
#[command(name = "sortie", version, about = "Schedule script runs over experiment directories")]
struct Cli {
    /// More logging, repeat for more. RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim and run the runs of an experiment until none is left
    Launch(LaunchArgs),
    /// Add configuration files to an experiment as sub-experiments
    Prepare {
        experiment: PathBuf,
        configs: Vec<PathBuf>,
        #[arg(long, default_value_t = 1)]
        runs_no: usize,
        /// configuration every file is merged onto
        #[arg(long)]
        default: Option<PathBuf>,
    },
    /// Count runs per state
    Status { experiments: Vec<PathBuf> },
    /// Make failed and lost runs claimable again
    Clean {
        experiment: PathBuf,
        #[arg(long)]
        crashed_only: bool,
        /// apply the changes instead of listing them
        #[arg(long = "do")]
        apply: bool,
    },
    /// Seal runs by index so that no scheduler picks them up
    Lock {
        experiment: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        runs: Vec<usize>,
        #[arg(long = "do")]
        apply: bool,
    },
    /// Terminate a scheduler and the workers of its session
    Abort {
        pid: i32,
        #[arg(long, default_value = "./results")]
        results: PathBuf,
        #[arg(long)]
        yes: bool,
    },
}

/// Session options, overriding the configuration file
#[derive(Args)]
struct LaunchArgs {
    experiment: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    script: Option<PathBuf>,
    #[arg(long)]
    interpreter: Option<String>,
    #[arg(long)]
    procs_no: Option<usize>,
    #[arg(long, value_delimiter = ',')]
    gpus: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    per_gpu: Vec<usize>,
    #[arg(long)]
    start_by: Option<u64>,
    #[arg(long)]
    end_by: Option<u64>,
    #[arg(long)]
    max_runs: Option<usize>,
    #[arg(long)]
    shuffle: bool,
    /// `key.path=value`, repeatable
    #[arg(long = "filter")]
    filters: Vec<String>,
    #[arg(long)]
    no_detach: bool,
    /// seed of the shuffle order
    #[arg(long)]
    seed: Option<u64>,
}

impl LaunchArgs {
    fn apply(&self, options: &mut SchedulerOptions) {
        if let Some(script) = self.script.as_ref() {
            options.script = script.clone();
        }
        if let Some(interpreter) = self.interpreter.as_ref() {
            options.interpreter = Some(interpreter.clone());
        }
        if let Some(procs_no) = self.procs_no {
            options.procs_no = procs_no;
        }
        if !self.gpus.is_empty() {
            options.gpus = self.gpus.clone();
        }
        if !self.per_gpu.is_empty() {
            options.per_gpu = self.per_gpu.clone();
        }
        if let Some(start_by) = self.start_by {
            options.start_by = start_by;
        }
        if let Some(end_by) = self.end_by {
            options.end_by = end_by;
        }
        if let Some(max_runs) = self.max_runs {
            options.max_runs = max_runs;
        }
        options.shuffle |= self.shuffle;
        options.filters.extend(self.filters.iter().cloned());
        options.no_detach |= self.no_detach;
    }
}

#[derive(Error, Debug)]
enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
    #[error(transparent)]
    Evolve(#[from] EvolveError),
    #[error(transparent)]
    Abort(#[from] AbortError),
}

fn launch(args: &LaunchArgs) -> Result<SessionReport, CommandError> {
    let mut options = match args.config.as_ref() {
        Some(path) => SchedulerOptions::load(path).unwrap_or_log(),
        None => SchedulerOptions::default(),
    };
    args.apply(&mut options);

    if options.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let session = SessionId::generate();
    info!("Starting session {session}");

    let report = match options.evolve.clone() {
        Some(evolve) => {
            experiment::create(&args.experiment)?;
            let source = EvolutionSource::new(&args.experiment, &evolve)?;
            Scheduler::new(&args.experiment, &options, session, source)?.run()?
        }
        None => {
            let mut collector = Collector::new(
                args.experiment.clone(),
                options.parsed_filters()?,
                options.shuffle,
            );
            if let Some(seed) = args.seed {
                collector = collector.seeded(seed);
            }
            Scheduler::new(&args.experiment, &options, session, collector)?.run()?
        }
    };

    Ok(report)
}

fn read_yaml(path: &Path) -> Result<Value, ConfigErrors> {
    let contents =
        fs::read_to_string(path).map_err(|_| ConfigErrors::FileNotFound(path.to_path_buf()))?;

    Ok(serde_yaml::from_str(&contents)?)
}

fn prepare(experiment: &Path, configs: &[PathBuf], runs_no: usize, default: Option<&Path>) -> Result<(), CommandError> {
    let base = match default {
        Some(path) => read_yaml(path)?,
        None => Value::Mapping(Mapping::new()),
    };
    experiment::create(experiment)?;

    for path in configs {
        let mut config = base.clone();
        deep_merge(&mut config, &read_yaml(path)?);

        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let added = experiment::add_subexperiment(
            experiment,
            &Blueprint {
                config: &config,
                title: &title,
                runs_no,
                attachments: Vec::new(),
            },
        )?;

        if !added.created {
            warn!("{} matches the existing {}", path.display(), added.path.display());
        }
        println!("{}: {} new runs", added.path.display(), added.runs.len());
    }

    Ok(())
}

fn run(command: Commands) -> Result<(), CommandError> {
    match command {
        Commands::Launch(args) => {
            let report = launch(&args)?;
            info!("{report}");
            println!("{}", report.status);
        }
        Commands::Prepare {
            experiment,
            configs,
            runs_no,
            default,
        } => prepare(&experiment, &configs, runs_no, default.as_deref())?,
        Commands::Status { experiments } => {
            for path in experiments {
                println!("{}: {}", path.display(), experiment::status(&path)?);
            }
        }
        Commands::Clean {
            experiment,
            crashed_only,
            apply,
        } => {
            let options = CleanOptions {
                crashed_only,
                apply,
                session: SessionId::generate(),
            };
            let report = experiment::clean(&experiment, &options)?;

            println!(
                "{} {} runs: {} locks, {} crash markers, {} start markers ({} sealed runs skipped)",
                if apply { "Cleaned" } else { "Would clean" },
                report.runs,
                report.locks,
                report.crashes,
                report.starts,
                report.sealed
            );
            if !apply && report.runs > 0 {
                println!("Pass --do to apply.");
            }
        }
        Commands::Lock {
            experiment,
            runs,
            apply,
        } => {
            let report = experiment::seal(&experiment, &runs, &SessionId::generate(), apply)?;

            println!(
                "{} {} runs, {} already claimed or started, {} lost to another session, {} without configuration",
                if apply { "Sealed" } else { "Would seal" },
                report.sealed,
                report.started,
                report.raced,
                report.strange
            );
        }
        Commands::Abort { pid, results, yes } => {
            let plan = abort::plan(&results, pid)?;
            println!("Will kill {plan}.");

            if yes {
                let signalled = abort::execute(&plan)?;
                println!("Sent SIGTERM to {signalled} processes.");
            } else {
                println!("Pass --yes to send SIGTERM.");
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "{e}");
            ExitCode::FAILURE
        }
    }
}
