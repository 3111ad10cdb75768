use crate::{
    collector::run_dirs,
    sentinel::{
        self, lock_owner, RunState, SentinelError, Sentinels, CFG, CFG_HASH, CRASH, END,
        EXPERIMENT, JOURNAL, LEAF, LOCK, SEAL, START,
    },
    sync::{
        locking,
        session::{session_alive, SessionId},
    },
};
use chrono::Local;
use serde::Serialize;
use serde_yaml::Value;
use sha2::{Digest, Sha224};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};


const VALID_CHARS: &str = "-_.()";
const MAX_NAME_LEN: usize = 255;
// sub-experiment directories raced for by concurrent producers
const MAX_CREATE_ATTEMPTS: usize = 64;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
    #[error("Failed to render run configuration")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0:?} is not an experiment")]
    NotAnExperiment(PathBuf),
    #[error("{0:?} exists and is not a directory")]
    NotADirectory(PathBuf),
    #[error("Run configurations must be mappings")]
    NotAMapping,
    #[error("Failed to find a free sub-experiment name in {0:?}")]
    NoFreeName(PathBuf),
}

pub fn is_experiment(path: &Path) -> bool {
    path.join(EXPERIMENT).is_file()
}

/// Create the experiment directory and its marker, keeping existing content
pub fn create(path: &Path) -> Result<(), ExperimentError> {
    fs::create_dir_all(path).map_err(SentinelError::io(path))?;
    sentinel::touch(&path.join(EXPERIMENT))?;

    Ok(())
}

/// Order independent rendering of a configuration: mapping entries are
/// sorted by their rendered key
pub fn canonical(value: &Value) -> String {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(String, String)> = mapping
                .iter()
                .map(|(key, value)| (canonical(key), canonical(value)))
                .collect();
            entries.sort();

            let entries: Vec<String> = entries
                .into_iter()
                .map(|(key, value)| format!("{key}_{value}"))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Sequence(sequence) => {
            let items: Vec<String> = sequence.iter().map(canonical).collect();
            format!("[{}]", items.join(","))
        }
        Value::String(string) => format!("{string:?}"),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => "null".to_string(),
        Value::Tagged(tagged) => format!("{}{}", tagged.tag, canonical(&tagged.value)),
    }
}

/// Hex sha-224 of the canonical rendering
pub fn config_hash(value: &Value) -> String {
    hex::encode(Sha224::digest(canonical(value).as_bytes()))
}

/// Replace everything but ascii letters, digits and `-_.()` with `_`
pub fn safe_file_name(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || VALID_CHARS.contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// What a new sub-experiment is made of
#[derive(Clone, Debug)]
pub struct Blueprint<'a> {
    pub config: &'a Value,
    pub title: &'a str,
    pub runs_no: usize,
    // extra files written into every new run before it becomes schedulable
    pub attachments: Vec<(&'a str, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubExperiment {
    pub path: PathBuf,
    pub hash: String,
    // false when a sub-experiment with the same configuration existed
    pub created: bool,
    // runs written by this call
    pub runs: Vec<PathBuf>,
}

/// Next free index and the known sub-experiments by configuration hash
fn existing_subexperiments(experiment: &Path) -> Result<(usize, BTreeMap<String, PathBuf>), ExperimentError> {
    let mut next_index = 0;
    let mut existing = BTreeMap::new();

    for entry in fs::read_dir(experiment).map_err(SentinelError::io(experiment))? {
        let entry = entry.map_err(SentinelError::io(experiment))?;

        if !entry.file_type().map_or(false, |kind| kind.is_dir()) {
            continue;
        }

        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.split('_').next())
            .and_then(|index| index.parse::<usize>().ok())
        {
            next_index = next_index.max(index + 1);
        }

        if let Ok(hash) = fs::read_to_string(entry.path().join(CFG_HASH)) {
            existing.insert(hash.trim().to_string(), entry.path());
        }
    }

    Ok((next_index, existing))
}

fn create_subexperiment(experiment: &Path, mut index: usize, title: &str, hash: &str) -> Result<PathBuf, ExperimentError> {
    for _ in 0..MAX_CREATE_ATTEMPTS {
        let mut name = safe_file_name(&format!("{index:04}_{title}"));
        if name.len() >= MAX_NAME_LEN {
            name = safe_file_name(&format!("{index:04}_{hash}"));
        }

        let path = experiment.join(name);
        match fs::create_dir(&path) {
            Ok(()) => {
                fs::write(path.join(CFG_HASH), hash).map_err(SentinelError::io(&path))?;
                return Ok(path);
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => index += 1,
            Err(error) => {
                return Err(SentinelError::Io { path, source: error }.into());
            }
        }
    }

    Err(ExperimentError::NoFreeName(experiment.to_path_buf()))
}

/// Materialize a configuration as a sub-experiment with `runs_no` runs.
///
/// A configuration hashing like an existing sub-experiment reuses it, and
/// runs that already hold a configuration or were claimed are left alone. The
/// `.__leaf` marker is written last, so a half-written run is never picked up.
pub fn add_subexperiment(experiment: &Path, blueprint: &Blueprint) -> Result<SubExperiment, ExperimentError> {
    if !is_experiment(experiment) {
        return Err(ExperimentError::NotAnExperiment(experiment.to_path_buf()));
    }
    if !blueprint.config.is_mapping() {
        return Err(ExperimentError::NotAMapping);
    }

    let hash = config_hash(blueprint.config);
    let (next_index, existing) = existing_subexperiments(experiment)?;
    let (path, created) = match existing.get(&hash) {
        Some(path) => {
            debug!(title = blueprint.title, "Sub-experiment already exists");
            (path.clone(), false)
        }
        None => (create_subexperiment(experiment, next_index, blueprint.title, &hash)?, true),
    };

    let mut runs = Vec::new();
    for run_id in 0..blueprint.runs_no {
        let run = path.join(run_id.to_string());

        if run.exists() && !run.is_dir() {
            return Err(ExperimentError::NotADirectory(run));
        }
        fs::create_dir_all(&run).map_err(SentinelError::io(&run))?;

        if run.join(LOCK).exists() || run.join(END).exists() {
            warn!("{} is locked", run.display());
            continue;
        }
        if run.join(CFG).exists() {
            continue;
        }

        let mut run_cfg = blueprint.config.clone();
        if let Value::Mapping(mapping) = &mut run_cfg {
            mapping.insert("out_dir".into(), run.to_string_lossy().into_owned().into());
            mapping.insert("run_id".into(), (run_id as u64).into());
            mapping.insert("title".into(), blueprint.title.into());
        }

        let cfg_path = run.join(CFG);
        fs::write(&cfg_path, serde_yaml::to_string(&run_cfg)?).map_err(SentinelError::io(&cfg_path))?;
        for (name, contents) in blueprint.attachments.iter() {
            let attachment = run.join(name);
            fs::write(&attachment, contents).map_err(SentinelError::io(&attachment))?;
        }
        sentinel::touch(&run.join(LEAF))?;

        runs.push(run);
    }

    info!(
        "Sub-experiment {} has {} new runs",
        path.display(),
        runs.len()
    );

    Ok(SubExperiment {
        path,
        hash,
        created,
        runs,
    })
}

/// State of a run, asking the experiment's session markers about lock owners
pub fn run_state(experiment: &Path, run: &Path, sentinels: &Sentinels) -> RunState {
    sentinels.state(|| {
        lock_owner(run)
            .ok()
            .flatten()
            .map_or(false, |owner| session_alive(experiment, &owner))
    })
}

/// Run counts of one experiment; sealed runs are counted apart from the states
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExperimentStatus {
    pub total: usize,
    pub unclaimed: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub lost: usize,
    pub sealed: usize,
}

impl ExperimentStatus {
    fn count(&mut self, state: RunState) {
        let counter = match state {
            RunState::Unclaimed => &mut self.unclaimed,
            RunState::Claimed => &mut self.claimed,
            RunState::Running => &mut self.running,
            RunState::Succeeded => &mut self.succeeded,
            RunState::Failed => &mut self.failed,
            RunState::Lost => &mut self.lost,
        };
        *counter += 1;
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {} | unclaimed: {} | claimed: {} | running: {} | succeeded: {} | failed: {} | lost: {}",
            self.total, self.unclaimed, self.claimed, self.running, self.succeeded, self.failed, self.lost
        )?;
        if self.sealed > 0 {
            write!(f, " | sealed: {}", self.sealed)?;
        }

        Ok(())
    }
}

pub fn status(experiment: &Path) -> Result<ExperimentStatus, ExperimentError> {
    if !is_experiment(experiment) {
        return Err(ExperimentError::NotAnExperiment(experiment.to_path_buf()));
    }

    let mut status = ExperimentStatus::default();

    for run in run_dirs(experiment) {
        let sentinels = Sentinels::read(&run)?;

        if !sentinels.leaf {
            continue;
        }

        status.total += 1;
        if sentinels.seal {
            status.sealed += 1;
        } else {
            status.count(run_state(experiment, &run, &sentinels));
        }
    }

    Ok(status)
}

fn journal(run: &Path, session: &SessionId, line: &str) -> Result<(), SentinelError> {
    let path = run.join(JOURNAL);
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");

    OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "[{timestamp}][{session}] {line}"))
        .map_err(SentinelError::io(&path))
}

#[derive(Clone, Debug)]
pub struct CleanOptions {
    // only reset failed runs, leave lost ones alone
    pub crashed_only: bool,
    // without it nothing is removed
    pub apply: bool,
    pub session: SessionId,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub runs: usize,
    pub locks: usize,
    pub crashes: usize,
    pub starts: usize,
    pub sealed: usize,
}

/// Make failed and lost runs claimable again by removing their lock, crash
/// and dangling start markers. Sealed runs are never touched.
pub fn clean(experiment: &Path, options: &CleanOptions) -> Result<CleanReport, ExperimentError> {
    if !is_experiment(experiment) {
        return Err(ExperimentError::NotAnExperiment(experiment.to_path_buf()));
    }

    let mut report = CleanReport::default();

    for run in run_dirs(experiment) {
        let sentinels = Sentinels::read(&run)?;

        if !sentinels.leaf {
            continue;
        }
        if sentinels.seal {
            report.sealed += 1;
            continue;
        }

        match run_state(experiment, &run, &sentinels) {
            RunState::Failed => {}
            RunState::Lost if !options.crashed_only => {}
            _ => continue,
        }

        let targets: Vec<&str> = [
            (LOCK, sentinels.lock),
            (CRASH, sentinels.crash),
            (START, sentinels.start),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect();

        report.runs += 1;
        report.locks += usize::from(sentinels.lock);
        report.crashes += usize::from(sentinels.crash);
        report.starts += usize::from(sentinels.start);

        if options.apply {
            for name in targets.iter() {
                sentinel::remove(&run.join(name))?;
            }
            journal(&run, &options.session, &format!("Removed {}.", targets.join(", ")))?;
        }
        debug!(run = ?run, "Cleaning {}", targets.join(", "));
    }

    Ok(report)
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SealReport {
    pub sealed: usize,
    // lost the lock to another session
    pub raced: usize,
    // already claimed, started or finished
    pub started: usize,
    // selected runs without configuration or leaf marker
    pub strange: usize,
}

/// Claim the unclaimed runs with the given indices for good: they get a lock
/// and a `.__seal`, which keeps schedulers and `clean` away from them
pub fn seal(experiment: &Path, indices: &[usize], session: &SessionId, apply: bool) -> Result<SealReport, ExperimentError> {
    if !is_experiment(experiment) {
        return Err(ExperimentError::NotAnExperiment(experiment.to_path_buf()));
    }

    let mut report = SealReport::default();

    for run in run_dirs(experiment) {
        let selected = run
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<usize>().ok())
            .map_or(false, |index| indices.contains(&index));
        if !selected {
            continue;
        }

        let sentinels = Sentinels::read(&run)?;
        if !(sentinels.cfg && sentinels.leaf) {
            report.strange += 1;
            continue;
        }
        if sentinels.lock || sentinels.start || sentinels.end || sentinels.crash {
            report.started += 1;
            continue;
        }

        if !apply {
            report.sealed += 1;
            continue;
        }

        match locking::claim(&run, session)? {
            Some(_) => {
                fs::write(run.join(SEAL), format!("{session}\n")).map_err(SentinelError::io(&run))?;
                journal(&run, session, "Locked and sealed.")?;
                report.sealed += 1;
            }
            None => report.raced += 1,
        }
    }

    Ok(report)
}
