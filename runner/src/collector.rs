use crate::{
    config::ConfigErrors,
    scheduler::{RunSource, SchedulerError},
    sentinel::{Sentinels, CFG},
};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde_yaml::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, trace, warn};


/// Every run directory of an experiment, i.e. the non-hidden directories two
/// levels below `root` (experiment -> sub-experiment -> run), in directory
/// listing order
pub fn run_dirs(root: &Path) -> impl Iterator<Item = PathBuf> {
    let mut builder = WalkBuilder::new(root);

    // only hidden entries are skipped, ignore files carry no meaning here
    builder.standard_filters(false).hidden(true).max_depth(Some(2));

    builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for runs: {e}");
                None
            }
        })
        .filter(|entry| entry.depth() == 2 && entry.file_type().map_or(false, |kind| kind.is_dir()))
        .map(DirEntry::into_path)
}

/// Equality test on a dotted key of a run configuration, parsed from
/// `optim.lr=0.001`
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    keys: Vec<String>,
    value: String,
}

impl FromStr for Filter {
    type Err = ConfigErrors;

    fn from_str(filter: &str) -> Result<Self, Self::Err> {
        match filter.split('=').collect_vec().as_slice() {
            [keys, value] if !keys.is_empty() && keys.split('.').all(|key| !key.is_empty()) => Ok(Self {
                keys: keys.split('.').map(str::to_string).collect(),
                value: value.to_string(),
            }),
            _ => Err(ConfigErrors::InvalidFilter(filter.to_string())),
        }
    }
}

impl Filter {
    /// Compare the configured value after converting the filter text to its type
    pub fn matches(&self, cfg: &Value) -> bool {
        let mut current = cfg;

        for key in self.keys.iter() {
            match current.get(key.as_str()) {
                Some(value) => current = value,
                None => return false,
            }
        }

        match current {
            Value::Null => matches!(self.value.as_str(), "None" | "null" | "~"),
            Value::Bool(flag) => self.value.parse::<bool>().map_or(false, |value| value == *flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => self.value.parse::<i64>().map_or(false, |value| value == integer),
                None => number
                    .as_f64()
                    .zip(self.value.parse::<f64>().ok())
                    .map_or(false, |(configured, value)| configured == value),
            },
            Value::String(string) => *string == self.value,
            _ => false,
        }
    }
}

/// Run-claim scanner over one experiment directory
#[derive(Debug)]
pub struct Collector {
    root: PathBuf,
    filters: Vec<Filter>,
    shuffle: bool,
    rng: StdRng,
}

impl Collector {
    pub fn new(root: PathBuf, filters: Vec<Filter>, shuffle: bool) -> Self {
        Self {
            root,
            filters,
            shuffle,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn accepts(&self, run: &Path) -> bool {
        match Sentinels::read(run) {
            Ok(sentinels) if sentinels.is_claimable() => {}
            Ok(_) => return false,
            Err(e) => {
                debug!(run = ?run, "Skipped unreadable run: {e}");
                return false;
            }
        }

        if self.filters.is_empty() {
            return true;
        }

        let cfg = fs::read_to_string(run.join(CFG))
            .map_err(|e| e.to_string())
            .and_then(|contents| serde_yaml::from_str::<Value>(&contents).map_err(|e| e.to_string()));

        match cfg {
            Ok(cfg) if self.filters.iter().all(|filter| filter.matches(&cfg)) => true,
            Ok(_) => {
                info!("Skipping {} as it was filtered out.", run.display());
                false
            }
            Err(e) => {
                warn!(run = ?run, "Failed to read configuration for filtering: {e}");
                false
            }
        }
    }

    /// Lazily yield the claimable runs in listing order
    pub fn scan(&self) -> impl Iterator<Item = PathBuf> + '_ {
        run_dirs(&self.root).filter(move |run| {
            trace!(run = ?run, "Checking run");
            self.accepts(run)
        })
    }
}

impl RunSource for Collector {
    fn candidates(&mut self) -> Result<Box<dyn Iterator<Item = PathBuf> + '_>, SchedulerError> {
        if !self.shuffle {
            return Ok(Box::new(self.scan()));
        }

        let mut runs = self.scan().collect_vec();
        runs.shuffle(&mut self.rng);
        debug!("Shuffled {} claimable runs", runs.len());

        Ok(Box::new(runs.into_iter()))
    }
}
