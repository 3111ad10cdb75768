use crate::{
    collector::run_dirs,
    config::EvolveConfig,
    experiment::{add_subexperiment, Blueprint, ExperimentError, SubExperiment},
    scheduler::{RunSource, SchedulerError},
    sentinel::{self, SentinelError, Sentinels, FITNESS, GENOTYPE, PHENOTYPE, TO_RUN},
};
use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_yaml::{Mapping, Value};
use sortie_genetics::{
    phenotype::deep_merge, ConstraintError, Genotype, GenotypeError, Mutator, Origin,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};


// genotypes bred in a row before giving up on finding an unexplored one
const MAX_BREED_ATTEMPTS: usize = 16;

#[derive(Error, Debug)]
pub enum EvolveError {
    #[error("Failed to load the gene template")]
    Template(#[source] GenotypeError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error("Constraint propagation failed, check the template constraints")]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
    #[error("Failed to (de)serialize a configuration")]
    Yaml(#[from] serde_yaml::Error),
}

/// One explored genotype and its mean fitness over the finished replicas
#[derive(Clone, Debug)]
pub struct Member {
    pub genotype: Genotype,
    pub fitness: f64,
}

fn origin_title(origin: Option<Origin>) -> &'static str {
    match origin {
        Some(Origin::Sample) | None => "sample",
        Some(Origin::Mutation) => "mutation",
        Some(Origin::Crossover) => "crossover",
        Some(Origin::Manual) => "manual",
    }
}

/// The runs no session claimed yet, in path order
fn claimable(runs: impl Iterator<Item = PathBuf>) -> Vec<PathBuf> {
    runs.filter(|run| Sentinels::read(run).map_or(false, |sentinels| sentinels.is_claimable()))
        .sorted()
        .collect()
}

fn read_fitness(run: &Path) -> Option<f64> {
    let contents = fs::read_to_string(run.join(FITNESS)).ok()?;

    match contents.trim().parse::<f64>() {
        Ok(fitness) if fitness.is_finite() => Some(fitness),
        _ => {
            warn!(run = ?run, "Ignoring unreadable fitness `{}`", contents.trim());
            None
        }
    }
}

/// Run source breeding new sub-experiments out of the fitness of the
/// explored ones
#[derive(Debug)]
pub struct EvolutionSource {
    experiment: PathBuf,
    config: EvolveConfig,
    mutator: Mutator,
    default: Value,
    rng: StdRng,
    population: Vec<Member>,
    // runs handed out earlier that no session claimed yet
    pending: Vec<PathBuf>,
    // `to_run` file whose replicas are in `pending`
    injected: Option<PathBuf>,
    steps: usize,
}

impl EvolutionSource {
    pub fn new(experiment: &Path, config: &EvolveConfig) -> Result<Self, EvolveError> {
        let mutator =
            Mutator::load(&config.template, config.max_propagation_steps).map_err(EvolveError::Template)?;
        let default = match config.default.as_ref() {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(SentinelError::io(path))?;
                serde_yaml::from_str(&contents)?
            }
            None => Value::Mapping(Mapping::new()),
        };

        let inbox = experiment.join(TO_RUN);
        fs::create_dir_all(&inbox).map_err(SentinelError::io(&inbox))?;

        Ok(Self {
            experiment: experiment.to_path_buf(),
            config: config.clone(),
            mutator,
            default,
            rng: match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            population: Vec::new(),
            pending: Vec::new(),
            injected: None,
            steps: 0,
        })
    }

    pub fn population(&self) -> &[Member] {
        &self.population
    }

    /// Re-read every sub-experiment's genotype and the fitness its runs
    /// reported, dropping reads below the floor
    pub fn refresh_population(&mut self) -> Result<(), EvolveError> {
        let mut explored: BTreeMap<PathBuf, (Option<PathBuf>, Vec<f64>)> = BTreeMap::new();

        for run in run_dirs(&self.experiment) {
            let Some(subexperiment) = run.parent().map(Path::to_path_buf) else {
                continue;
            };
            let entry = explored.entry(subexperiment).or_default();

            if entry.0.is_none() && run.join(GENOTYPE).is_file() {
                entry.0 = Some(run.join(GENOTYPE));
            }
            if let Some(fitness) = read_fitness(&run) {
                match self.config.fitness_floor {
                    Some(floor) if fitness < floor => {
                        debug!(run = ?run, "Fitness {fitness} is below the floor {floor}")
                    }
                    _ => entry.1.push(fitness),
                }
            }
        }

        self.population.clear();
        for (subexperiment, (genotype, reads)) in explored {
            let (Some(genotype), false) = (genotype, reads.is_empty()) else {
                continue;
            };

            match self.mutator.read(&genotype) {
                Ok(genotype) => self.population.push(Member {
                    genotype,
                    fitness: reads.iter().sum::<f64>() / reads.len() as f64,
                }),
                Err(e) => warn!(subexperiment = ?subexperiment, "Skipping unreadable genotype: {e}"),
            }
        }

        info!("Population has {} scored genotypes", self.population.len());

        Ok(())
    }

    /// Sample while the population is small, then cross or mutate parents
    /// picked by the configured selection
    pub fn breed(&mut self) -> Result<Genotype, EvolveError> {
        if self.population.len() < self.config.min_population {
            return Ok(self.mutator.sample(&mut self.rng)?);
        }

        let fitness: Vec<f64> = self.population().iter().map(|member| member.fitness).collect();
        let selection = self.config.selection;

        if self.rng.gen_bool(self.config.crossover_rate) {
            let parents = (
                selection.pick(&fitness, &mut self.rng),
                selection.pick(&fitness, &mut self.rng),
            );
            if let (Some(first), Some(second)) = parents {
                return Ok(self.mutator.crossover(
                    &self.population[first].genotype,
                    &self.population[second].genotype,
                    &mut self.rng,
                )?);
            }
        } else if let Some(parent) = selection.pick(&fitness, &mut self.rng) {
            let follow_momentum = self.rng.gen_bool(self.config.momentum_weight);
            let parent = &self.population[parent];

            return Ok(self.mutator.mutate(
                &parent.genotype,
                Some(parent.fitness),
                follow_momentum,
                &mut self.rng,
            )?);
        }

        Ok(self.mutator.sample(&mut self.rng)?)
    }

    /// Write the genotype out as a sub-experiment
    pub fn materialize(&self, genotype: &Genotype) -> Result<SubExperiment, EvolveError> {
        let phenotype = self.mutator.phenotype(genotype);
        let mut config = self.default.clone();
        deep_merge(&mut config, &phenotype);

        let blueprint = Blueprint {
            config: &config,
            title: origin_title(genotype.meta.source),
            runs_no: self.config.runs_no,
            attachments: vec![
                (GENOTYPE, serde_yaml::to_string(&self.mutator.encode(genotype)?)?),
                (PHENOTYPE, serde_yaml::to_string(&phenotype)?),
            ],
        };

        Ok(add_subexperiment(&self.experiment, &blueprint)?)
    }

    /// Schedule the genotype files dropped into `to_run/`, in name order.
    /// A file stays until every replica of its sub-experiment is claimed.
    fn inject(&mut self) -> Result<Vec<PathBuf>, EvolveError> {
        let inbox = self.experiment.join(TO_RUN);
        let Ok(entries) = fs::read_dir(&inbox) else {
            return Ok(Vec::new());
        };

        let files = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .sorted()
            .collect_vec();

        for file in files {
            match self.mutator.read(&file) {
                Ok(mut genotype) => {
                    genotype.meta.source = Some(Origin::Manual);
                    let subexperiment = self.materialize(&genotype)?;
                    let runs = claimable(
                        (0..self.config.runs_no).map(|run_id| subexperiment.path.join(run_id.to_string())),
                    );

                    if !runs.is_empty() {
                        info!(file = ?file, "Scheduling {} replicas of an injected genotype", runs.len());
                        self.injected = Some(file);
                        return Ok(runs);
                    }
                    debug!(file = ?file, "Every replica of the injected genotype is scheduled");
                }
                Err(e) => warn!(file = ?file, "Deleting invalid genotype: {e}"),
            }

            sentinel::remove(&file)?;
        }

        Ok(Vec::new())
    }

    /// Runs for the next claim: injected genotypes first, then bred ones
    pub fn produce(&mut self) -> Result<Vec<PathBuf>, EvolveError> {
        let injected = self.inject()?;
        if !injected.is_empty() {
            return Ok(injected);
        }

        for _ in 0..MAX_BREED_ATTEMPTS {
            let genotype = self.breed()?;
            let runs = self.materialize(&genotype)?.runs;

            if !runs.is_empty() {
                return Ok(runs);
            }
            debug!("Bred an already explored genotype");
        }

        warn!("No unexplored genotype after {MAX_BREED_ATTEMPTS} attempts");

        Ok(Vec::new())
    }
}

impl RunSource for EvolutionSource {
    fn candidates(&mut self) -> Result<Box<dyn Iterator<Item = PathBuf> + '_>, SchedulerError> {
        if self.steps % self.config.refresh_every.max(1) == 0 {
            self.refresh_population()?;
        }
        self.steps += 1;

        self.pending.retain(|run| {
            Sentinels::read(run).map_or(false, |sentinels| sentinels.is_claimable())
        });
        if self.pending.is_empty() {
            if let Some(file) = self.injected.take() {
                debug!(file = ?file, "Every replica of the injected genotype is claimed");
                sentinel::remove(&file)?;
            }
            // replicas left behind by earlier sessions go before new genotypes
            self.pending = claimable(run_dirs(&self.experiment));
            if self.pending.is_empty() {
                self.pending = self.produce()?;
            }
        }

        Ok(Box::new(self.pending.iter().cloned()))
    }
}
