use crate::{
    executors::liveness::cmdline,
    experiment::is_experiment,
    sentinel::{SentinelError, CRASH},
    sync::session::{sessions, SessionId},
};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    process,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
mod abort_test;

#[derive(Error, Debug)]
pub enum AbortError {
    #[error("No experiment under {results:?} was launched by process {pid}")]
    NotFound { pid: i32, results: PathBuf },
    #[error("Failed to signal process {pid}")]
    Signal { pid: i32, source: Errno },
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
}

/// A scheduler session and the workers it left running
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbortPlan {
    pub experiment: PathBuf,
    pub session: SessionId,
    pub scheduler: i32,
    pub children: Vec<i32>,
}

impl fmt::Display for AbortPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subprocesses of {}::{} (scheduler {})",
            self.children.len(),
            self.experiment.display(),
            self.session,
            self.scheduler
        )
    }
}

fn experiments(results: &Path) -> Result<Vec<PathBuf>, SentinelError> {
    if is_experiment(results) {
        return Ok(vec![results.to_path_buf()]);
    }

    let mut experiments = Vec::new();
    for entry in fs::read_dir(results).map_err(SentinelError::io(results))? {
        let path = entry.map_err(SentinelError::io(results))?.path();
        if is_experiment(&path) {
            experiments.push(path);
        }
    }
    experiments.sort();

    Ok(experiments)
}

/// The experiment and session whose PID file names `pid`
pub fn find_session(results: &Path, pid: i32) -> Result<Option<(PathBuf, SessionId)>, AbortError> {
    for experiment in experiments(results)? {
        if let Some((session, _)) = sessions(&experiment)?
            .into_iter()
            .find(|(_, session_pid)| *session_pid == pid)
        {
            return Ok(Some((experiment, session)));
        }
    }

    Ok(None)
}

/// Live processes started for `session`. The wrappers recording the crash
/// stamp are left alone so that killed workers end up `Failed`.
pub fn running_children(session: &SessionId) -> Vec<i32> {
    let marker = format!("--session-id {session}");
    let own = process::id() as i32;
    let Ok(entries) = fs::read_dir("/proc") else {
        warn!("Failed to list /proc");
        return Vec::new();
    };

    let mut pids: Vec<i32> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            cmdline(*pid).map_or(false, |cmdline| {
                cmdline.contains(&marker) && !cmdline.contains(CRASH)
            })
        })
        .collect();
    pids.sort_unstable();

    pids
}

pub fn plan(results: &Path, pid: i32) -> Result<AbortPlan, AbortError> {
    let (experiment, session) = find_session(results, pid)?.ok_or_else(|| AbortError::NotFound {
        pid,
        results: results.to_path_buf(),
    })?;
    let children = running_children(&session);

    Ok(AbortPlan {
        experiment,
        session,
        scheduler: pid,
        children,
    })
}

/// SIGTERM the scheduler and its workers. Processes that exited in the
/// meantime are skipped; returns how many were signalled.
pub fn execute(plan: &AbortPlan) -> Result<usize, AbortError> {
    let mut signalled = 0;

    for pid in std::iter::once(plan.scheduler).chain(plan.children.iter().copied()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, "Sent SIGTERM");
                signalled += 1;
            }
            Err(Errno::ESRCH) => debug!(pid, "Already gone"),
            Err(source) => return Err(AbortError::Signal { pid, source }),
        }
    }

    info!("Aborted {plan}");

    Ok(signalled)
}
