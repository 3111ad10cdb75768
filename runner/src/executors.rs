pub mod liveness;
mod local;
mod shell;

use crate::{
    config::SchedulerOptions,
    sentinel::{SentinelError, CFG},
    sync::session::SessionId,
};
use serde_yaml::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, instrument};

pub use liveness::ProcessHandle;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn the worker for {run:?}")]
    Spawn { run: PathBuf, source: io::Error },
    #[error("Failed to wait for the worker of {run:?}")]
    Wait { run: PathBuf, source: io::Error },
    #[error("Failed to redirect worker output to {path:?}")]
    Output { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
}

/// How a worker relates to the scheduler that launched it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// `nohup` in its own process group, survives the scheduler
    Detached,
    /// plain child shell of the scheduler
    Attached,
    /// run to completion inside `launch`, sentinels written by the scheduler
    InPlace,
}

/// Everything needed to start one worker
#[derive(Clone, Debug)]
pub struct Worker {
    pub run: PathBuf,
    pub title: String,
    pub gpu: Option<String>,
    // shell text running the user script, also used to recognize the process
    pub command: String,
    pub env: Vec<(String, String)>,
}

/// Title stored in the run configuration, falling back to the directory name
fn run_title(run: &Path) -> String {
    let configured = fs::read_to_string(run.join(CFG))
        .ok()
        .and_then(|contents| serde_yaml::from_str::<Value>(&contents).ok())
        .and_then(|cfg| cfg.get("title").and_then(Value::as_str).map(str::to_string));

    configured.unwrap_or_else(|| {
        debug!(run = ?run, "No title in the run configuration");
        run.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    })
}

/// Launches workers for claimed runs of one session
#[derive(Clone, Debug)]
pub struct Supervisor {
    script: PathBuf,
    interpreter: Option<String>,
    session: SessionId,
    mode: LaunchMode,
    accelerator_env: String,
}

impl Supervisor {
    pub fn new(options: &SchedulerOptions, session: SessionId) -> Self {
        Self {
            script: options.script.clone(),
            interpreter: options.interpreter.clone(),
            mode: if options.no_detach {
                LaunchMode::InPlace
            } else {
                LaunchMode::Detached
            },
            accelerator_env: options.accelerator_env.clone(),
            session,
        }
    }

    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    pub fn worker(&self, run: &Path, gpu: Option<&str>, end_by: Option<Duration>) -> Worker {
        let mut env = Vec::new();

        if let Some(gpu) = gpu {
            env.push((self.accelerator_env.clone(), gpu.to_string()));
        }
        if let Some(end_by) = end_by {
            env.push(("ENDBY".to_string(), end_by.as_secs().to_string()));
        }

        Worker {
            run: run.to_path_buf(),
            title: run_title(run),
            gpu: gpu.map(str::to_string),
            command: shell::worker_command(
                self.interpreter.as_deref(),
                &self.script,
                &run.join(CFG),
                &self.session,
            ),
            env,
        }
    }

    /// Start the worker of an already claimed run.
    ///
    /// On error nothing was started and the run keeps its lock without a
    /// start marker.
    #[instrument(skip(self), level = "info")]
    pub fn launch(
        &self,
        run: &Path,
        gpu: Option<&str>,
        end_by: Option<Duration>,
    ) -> Result<ProcessHandle, ExecutorError> {
        let worker = self.worker(run, gpu, end_by);

        match self.mode {
            LaunchMode::Detached => shell::spawn(worker, true),
            LaunchMode::Attached => shell::spawn(worker, false),
            LaunchMode::InPlace => local::run(worker, end_by),
        }
    }
}
