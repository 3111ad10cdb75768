use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Child,
};
use tracing::{debug, warn};


/// `state` and `starttime` out of /proc/<pid>/stat
fn stat(pid: i32) -> Option<(char, u64)> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // the command name may contain spaces and parentheses
    let (_, fields) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = fields.split_whitespace().collect();

    Some((fields.first()?.chars().next()?, fields.get(19)?.parse().ok()?))
}

/// Clock ticks since boot at which the process started, stable for its lifetime
pub fn start_time(pid: i32) -> Option<u64> {
    stat(pid).map(|(_, start)| start)
}

/// Arguments of a live process joined by spaces
pub fn cmdline(pid: i32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;

    Some(
        raw.split(|byte| *byte == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Whether `pid` names a process that has not exited yet
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => !matches!(stat(pid), Some(('Z', _))),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Process table check for processes we cannot wait on: the pid must be
/// alive, still carry the recorded start time and embed `command` in its
/// command line. Best effort, only meaningful next to the sentinel files.
pub fn process_matches(pid: i32, started: Option<u64>, command: &str) -> bool {
    pid_alive(pid)
        && started.map_or(true, |started| start_time(pid) == Some(started))
        && cmdline(pid).map_or(false, |cmdline| cmdline.contains(command))
}

/// A launched worker as tracked by its scheduler
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub gpu: Option<String>,
    pub title: String,
    // text that appears in the command line of the worker and its wrapper
    pub command: String,
    pub run: PathBuf,
    child: Option<Child>,
    started: Option<u64>,
}

impl ProcessHandle {
    pub fn spawned(child: Child, run: &Path, gpu: Option<String>, title: String, command: String) -> Self {
        let pid = child.id();

        Self {
            pid: Some(pid),
            started: i32::try_from(pid).ok().and_then(start_time),
            gpu,
            title,
            command,
            run: run.to_path_buf(),
            child: Some(child),
        }
    }

    /// Handle of a worker that already ran to completion
    pub fn finished(run: &Path, gpu: Option<String>, title: String, command: String) -> Self {
        Self {
            pid: None,
            started: None,
            gpu,
            title,
            command,
            run: run.to_path_buf(),
            child: None,
        }
    }

    /// Poll the worker without blocking
    pub fn still_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(title = %self.title, status = %status, "Worker exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(title = %self.title, "Failed to poll worker, checking the process table: {e}");
                i32::try_from(child.id())
                    .map_or(false, |pid| process_matches(pid, self.started, &self.command))
            }
        }
    }
}
