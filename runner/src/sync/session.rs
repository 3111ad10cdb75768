use crate::{
    executors::liveness::pid_alive,
    sentinel::{SentinelError, SESSION_PREFIX},
};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process,
    str::FromStr,
};
use tracing::{debug, error};
use uuid::Uuid;


/// Opaque identifier of one scheduler session
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '/') {
            Err(format!("`{id}` is not a valid session id"))
        } else {
            Ok(Self(id.to_string()))
        }
    }
}

pub fn marker_path(experiment: &Path, session: &str) -> PathBuf {
    experiment.join(format!("{SESSION_PREFIX}{session}"))
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()?
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

/// PID file of a running session, removed again when dropped
#[derive(Debug)]
pub struct SessionMarker {
    path: PathBuf,
}

impl SessionMarker {
    pub fn create(experiment: &Path, session: &SessionId) -> Result<Self, SentinelError> {
        let path = marker_path(experiment, session.as_str());

        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", process::id()))
            .map_err(SentinelError::io(&path))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionMarker {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(marker = ?self.path, "Removed session marker"),
            Err(error) => error!(error = ?error, "Failed to remove session marker"),
        }
    }
}

/// Sessions that left a PID file in the experiment, with their PIDs
pub fn sessions(experiment: &Path) -> Result<Vec<(SessionId, i32)>, SentinelError> {
    let mut sessions = Vec::new();

    for entry in fs::read_dir(experiment).map_err(SentinelError::io(experiment))? {
        let entry = entry.map_err(SentinelError::io(experiment))?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|name| name.strip_prefix(SESSION_PREFIX)) else {
            continue;
        };

        // `.__experiment` and friends hold no PID
        if let (Ok(id), Some(pid)) = (id.parse::<SessionId>(), read_pid(&entry.path())) {
            sessions.push((id, pid));
        }
    }

    Ok(sessions)
}

/// Whether the session owning a lock still runs. Anonymous locks and
/// sessions without a PID file count as dead.
pub fn session_alive(experiment: &Path, session: &str) -> bool {
    !session.is_empty()
        && read_pid(&marker_path(experiment, session)).map_or(false, pid_alive)
}
