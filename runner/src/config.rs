use crate::collector::Filter;
use serde::{Deserialize, Serialize};
use sortie_genetics::Selection;
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};


// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse configuration")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("per_gpu lists {caps} caps for {gpus} gpus, expected 1 or {gpus}")]
    MismatchedPerGpu { gpus: usize, caps: usize },
    #[error("Filter `{0}` is not of the form key.path=value")]
    InvalidFilter(String),
    #[error("{0:?} is not an experiment")]
    NotAnExperiment(PathBuf),
    #[error("Preflight checks failed")]
    Preflight,
}

/// Flat, read-only options of one scheduler session
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerOptions {
    // the user script, invoked as `<interpreter> <script> <cfg> --session-id <id>`
    #[serde(default)]
    pub script: PathBuf,
    // shell words placed in front of the script, e.g. `python -u`
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default = "default_procs_no")]
    pub procs_no: usize,
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default = "default_per_gpu")]
    pub per_gpu: Vec<usize>,
    // seconds after which no new run is launched, 0 disables
    #[serde(default)]
    pub start_by: u64,
    // seconds the whole session may take, exported to workers as ENDBY
    #[serde(default)]
    pub end_by: u64,
    // 0 disables
    #[serde(default)]
    pub max_runs: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub filters: Vec<String>,
    // run the single worker inside the scheduler instead of detaching it
    #[serde(default)]
    pub no_detach: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_accelerator_env")]
    pub accelerator_env: String,

    #[serde(default)]
    pub evolve: Option<EvolveConfig>,
}

/// Parameters of the evolutionary run source
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EvolveConfig {
    // gene template with `gtype` annotated leaves and optional constraints
    pub template: PathBuf,
    // configuration the phenotype is merged onto
    #[serde(default)]
    pub default: Option<PathBuf>,
    // replicas per genotype
    #[serde(default = "default_runs_no")]
    pub runs_no: usize,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default = "default_min_population")]
    pub min_population: usize,
    #[serde(default = "default_rate")]
    pub crossover_rate: f64,
    #[serde(default = "default_rate")]
    pub momentum_weight: f64,
    // scheduler steps between two fitness refreshes
    #[serde(default = "default_refresh_every")]
    pub refresh_every: usize,
    #[serde(default)]
    pub fitness_floor: Option<f64>,
    #[serde(default = "default_max_propagation_steps")]
    pub max_propagation_steps: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            script: PathBuf::new(),
            interpreter: None,
            procs_no: default_procs_no(),
            gpus: Vec::new(),
            per_gpu: default_per_gpu(),
            start_by: 0,
            end_by: 0,
            max_runs: 0,
            shuffle: false,
            filters: Vec::new(),
            no_detach: false,
            poll_interval_ms: default_poll_interval_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            accelerator_env: default_accelerator_env(),
            evolve: None,
        }
    }
}

impl SchedulerOptions {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path)
            .map_err(|_| ConfigErrors::FileNotFound(path.to_path_buf()))?;

        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn start_by(&self) -> Option<Duration> {
        (self.start_by > 0).then(|| Duration::from_secs(self.start_by))
    }

    pub fn end_by(&self) -> Option<Duration> {
        (self.end_by > 0).then(|| Duration::from_secs(self.end_by))
    }

    pub fn max_runs(&self) -> Option<usize> {
        (self.max_runs > 0).then_some(self.max_runs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn parsed_filters(&self) -> Result<Vec<Filter>, ConfigErrors> {
        self.filters.iter().map(|filter| filter.parse()).collect()
    }

    /// Report every problem with the options before failing, returns whether
    /// any error was found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.procs_no == 0 {
            error!("procs_no must be at least 1");
            contains_error = true;
        }

        if !self.gpus.is_empty() && self.per_gpu.len() != 1 && self.per_gpu.len() != self.gpus.len() {
            error!(
                "per_gpu has {} entries but there are {} gpus, use either one shared cap or one cap per gpu",
                self.per_gpu.len(),
                self.gpus.len()
            );
            contains_error = true;
        }

        if self.no_detach && self.procs_no != 1 {
            error!("no_detach only works with a single process (procs_no = 1)");
            contains_error = true;
        }

        if self.no_detach && !self.gpus.is_empty() {
            warn!("no_detach runs in place, the gpu list only sets {}", self.accelerator_env);
        }

        if self.start_by > 0 && self.end_by > 0 && self.start_by > self.end_by {
            warn!("start_by is later than end_by, end_by will stop the session first");
        }

        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms is 0, falling back to 1 ms");
            self.poll_interval_ms = 1;
        }

        if self.backoff_cap_ms < self.poll_interval_ms {
            warn!("backoff_cap_ms is below poll_interval_ms, raising it");
            self.backoff_cap_ms = self.poll_interval_ms;
        }

        if !self.script.is_file() {
            error!(
                "Failed to find the script. Either not a file or not found at {}",
                self.script.to_string_lossy()
            );
            contains_error = true;
        } else if self.interpreter.is_none() {
            match check_executable(&self.script) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Script {} is not executable and no interpreter is set",
                        self.script.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {} is an executable: {e}",
                        self.script.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        for filter in self.filters.iter() {
            if let Err(e) = filter.parse::<Filter>() {
                error!("{e}");
                contains_error = true;
            }
        }

        if let Some(evolve) = self.evolve.as_ref() {
            contains_error |= evolve.preflight_checks();
        }

        contains_error
    }
}

impl EvolveConfig {
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if !self.template.is_file() {
            error!(
                "evolve.template not found at {}",
                self.template.to_string_lossy()
            );
            contains_error = true;
        }

        if let Some(default) = self.default.as_ref().filter(|path| !path.is_file()) {
            error!("evolve.default not found at {}", default.to_string_lossy());
            contains_error = true;
        }

        if self.runs_no == 0 {
            error!("evolve.runs_no must be at least 1");
            contains_error = true;
        }

        if self.refresh_every == 0 {
            error!("evolve.refresh_every must be at least 1");
            contains_error = true;
        }

        for (name, rate) in [
            ("crossover_rate", self.crossover_rate),
            ("momentum_weight", self.momentum_weight),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                error!("evolve.{name} ({rate}) must lie in [0, 1]");
                contains_error = true;
            }
        }

        if self.max_propagation_steps == 0 {
            error!("evolve.max_propagation_steps must be at least 1");
            contains_error = true;
        }

        contains_error
    }
}

fn default_procs_no() -> usize {
    1
}

fn default_per_gpu() -> Vec<usize> {
    vec![1]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    16_000
}

fn default_accelerator_env() -> String {
    "CUDA_VISIBLE_DEVICES".to_string()
}

fn default_runs_no() -> usize {
    1
}

fn default_min_population() -> usize {
    10
}

fn default_rate() -> f64 {
    0.5
}

fn default_refresh_every() -> usize {
    10
}

fn default_max_propagation_steps() -> usize {
    sortie_genetics::constraints::DEFAULT_MAX_STEPS
}
