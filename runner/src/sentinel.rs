use chrono::Utc;
use serde::Serialize;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[cfg(test)]
mod sentinel_test;

// per run
pub const CFG: &str = "cfg.yaml";
pub const LEAF: &str = ".__leaf";
pub const LOCK: &str = ".__lock";
pub const START: &str = ".__start";
pub const END: &str = ".__end";
pub const CRASH: &str = ".__crash";
pub const SEAL: &str = ".__seal";
pub const JOURNAL: &str = ".__journal";
pub const OUT: &str = "out";
pub const ERR: &str = "err";
pub const GENOTYPE: &str = "genotype.yaml";
pub const PHENOTYPE: &str = "phenotype.yaml";
pub const FITNESS: &str = "fitness";

// per sub-experiment
pub const CFG_HASH: &str = ".__cfg_hash";

// per experiment
pub const EXPERIMENT: &str = ".__experiment";
pub const STOP: &str = ".STOP";
pub const TO_RUN: &str = "to_run";
pub const SESSION_PREFIX: &str = ".__";

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("failed to access {path:?}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{path:?} does not hold a unix timestamp")]
    Timestamp { path: PathBuf },
}

impl SentinelError {
    pub fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Lifecycle of a single run as derived from its sentinel files
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Unclaimed,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Lost,
}

/// Snapshot of which sentinel files a run directory holds.
///
/// The directory is listed once, so the snapshot is consistent with a
/// single point in time only as far as the filesystem listing is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sentinels {
    pub cfg: bool,
    pub leaf: bool,
    pub lock: bool,
    pub start: bool,
    pub end: bool,
    pub crash: bool,
    pub seal: bool,
}

impl Sentinels {
    pub fn read(run: &Path) -> Result<Self, SentinelError> {
        let mut sentinels = Self::default();

        for entry in fs::read_dir(run).map_err(SentinelError::io(run))? {
            let entry = entry.map_err(SentinelError::io(run))?;

            match entry.file_name().to_str() {
                Some(CFG) => sentinels.cfg = true,
                Some(LEAF) => sentinels.leaf = true,
                Some(LOCK) => sentinels.lock = true,
                Some(START) => sentinels.start = true,
                Some(END) => sentinels.end = true,
                Some(CRASH) => sentinels.crash = true,
                Some(SEAL) => sentinels.seal = true,
                _ => {}
            }
        }

        Ok(sentinels)
    }

    /// A run a fresh pass may claim: configured, schedulable and untouched
    pub fn is_claimable(&self) -> bool {
        self.cfg && self.leaf && !(self.lock || self.start || self.end || self.crash)
    }

    /// Derive the run state, asking `owner_alive` only when the verdict
    /// depends on whether the session holding the lock still exists.
    pub fn state(&self, owner_alive: impl FnOnce() -> bool) -> RunState {
        match (self.end, self.crash, self.lock, self.start) {
            (true, _, _, _) => RunState::Succeeded,
            (_, true, _, _) => RunState::Failed,
            // started, then the lock vanished without a verdict
            (_, _, false, true) => RunState::Lost,
            (_, _, false, false) => RunState::Unclaimed,
            (_, _, true, start) => match (owner_alive(), start) {
                (false, _) => RunState::Lost,
                (true, true) => RunState::Running,
                (true, false) => RunState::Claimed,
            },
        }
    }
}

/// Atomically create `path` holding `contents`.
///
/// Returns `Ok(false)` when the file already exists, which is the only way a
/// claim race is reported.
pub fn create_exclusive(path: &Path, contents: &str) -> Result<bool, SentinelError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())
                .map_err(SentinelError::io(path))?;
            Ok(true)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(error) => Err(SentinelError::Io {
            path: path.to_path_buf(),
            source: error,
        }),
    }
}

/// Create an empty marker, leaving an existing one untouched
pub fn touch(path: &Path) -> Result<(), SentinelError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map(|_| ())
        .map_err(SentinelError::io(path))
}

/// Remove a sentinel, treating an already missing file as success
pub fn remove(path: &Path) -> Result<bool, SentinelError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(SentinelError::Io {
            path: path.to_path_buf(),
            source: error,
        }),
    }
}

/// Write the current unix time into `path`, the same format `date +%s` uses
pub fn stamp(path: &Path) -> Result<i64, SentinelError> {
    let now = Utc::now().timestamp();

    fs::write(path, format!("{now}\n")).map_err(SentinelError::io(path))?;

    Ok(now)
}

pub fn read_stamp(path: &Path) -> Result<i64, SentinelError> {
    fs::read_to_string(path)
        .map_err(SentinelError::io(path))?
        .trim()
        .parse()
        .map_err(|_| SentinelError::Timestamp {
            path: path.to_path_buf(),
        })
}

/// Session id stored in a run's lock, empty for anonymous locks
pub fn lock_owner(run: &Path) -> Result<Option<String>, SentinelError> {
    let path = run.join(LOCK);

    match fs::read_to_string(&path) {
        Ok(owner) => Ok(Some(owner.trim().to_string())),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(SentinelError::Io { path, source: error }),
    }
}
