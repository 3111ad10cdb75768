use super::{ExecutorError, ProcessHandle, Worker};
use crate::sentinel::{self, CRASH, END, ERR, LOCK, OUT, START};
use std::{
    fs::File,
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{info, warn};
use wait_timeout::ChildExt;


fn capture(worker: &Worker, name: &str) -> Result<File, ExecutorError> {
    let path = worker.run.join(name);

    File::create(&path).map_err(|source| ExecutorError::Output { path, source })
}

/// Run the worker to completion inside the scheduler, writing the lifecycle
/// sentinels here instead of in a wrapper shell. `budget` bounds the run
/// time, a worker still running after it is killed and counts as crashed.
pub fn run(worker: Worker, budget: Option<Duration>) -> Result<ProcessHandle, ExecutorError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&worker.command)
        .envs(worker.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(capture(&worker, OUT)?)
        .stderr(capture(&worker, ERR)?)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            run: worker.run.clone(),
            source,
        })?;

    sentinel::stamp(&worker.run.join(START))?;
    info!(title = %worker.title, pid = child.id(), "Starting in place");

    let start = Instant::now();
    let waited = match budget {
        Some(budget) => child.wait_timeout(budget),
        None => child.wait().map(Some),
    };

    let success = match waited {
        Ok(Some(status)) => status.success(),
        Ok(None) => {
            warn!(title = %worker.title, "Out of time, killing the worker");
            child.kill().and_then(|_| child.wait()).map_err(|source| ExecutorError::Wait {
                run: worker.run.clone(),
                source,
            })?;
            false
        }
        Err(source) => {
            return Err(ExecutorError::Wait {
                run: worker.run.clone(),
                source,
            })
        }
    };

    sentinel::stamp(&worker.run.join(if success { END } else { CRASH }))?;
    sentinel::remove(&worker.run.join(LOCK))?;
    info!(
        title = %worker.title,
        success,
        "Finished in {:.2}s",
        start.elapsed().as_secs_f64()
    );

    Ok(ProcessHandle::finished(
        &worker.run,
        worker.gpu,
        worker.title,
        worker.command,
    ))
}
