use itertools::Itertools;
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};


/// Distribution used to pick parents out of a population's fitness vector
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Roulette,
    Rank,
    SquaredRank,
}

impl Selection {
    pub fn probabilities(&self, fitness: &[f64]) -> Vec<f64> {
        match self {
            Self::Roulette => roulette_probs(fitness),
            Self::Rank => rank_probs(fitness),
            Self::SquaredRank => squared_rank_probs(fitness),
        }
    }

    /// Index of one individual drawn according to this distribution
    pub fn pick<R: Rng + ?Sized>(&self, fitness: &[f64], rng: &mut R) -> Option<usize> {
        WeightedIndex::new(self.probabilities(fitness))
            .ok()
            .map(|distribution| distribution.sample(rng))
    }
}

fn normalize(weights: Vec<f64>) -> Vec<f64> {
    let total: f64 = weights.iter().sum();

    if total > 0.0 && total.is_finite() {
        weights.into_iter().map(|weight| weight / total).collect()
    } else {
        let uniform = 1.0 / weights.len() as f64;
        weights.into_iter().map(|_| uniform).collect()
    }
}

/// Fitness proportional, exponentiated first when any fitness is negative
pub fn roulette_probs(fitness: &[f64]) -> Vec<f64> {
    if fitness.is_empty() {
        return Vec::new();
    }

    if fitness.iter().any(|value| *value < 0.0) {
        let max = fitness.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        normalize(fitness.iter().map(|value| (value - max).exp()).collect())
    } else {
        normalize(fitness.to_vec())
    }
}

/// Position of each individual when sorted from best to worst, starting at 1
fn ranks(fitness: &[f64]) -> Vec<usize> {
    let mut ranks = vec![0; fitness.len()];

    for (rank, (index, _)) in fitness
        .iter()
        .enumerate()
        .sorted_by(|(_, a), (_, b)| b.total_cmp(a))
        .enumerate()
    {
        ranks[index] = rank + 1;
    }

    ranks
}

/// The best individual weighs `n`, the worst weighs 1
pub fn rank_probs(fitness: &[f64]) -> Vec<f64> {
    let n = fitness.len();

    normalize(
        ranks(fitness)
            .into_iter()
            .map(|rank| (n - rank + 1) as f64)
            .collect(),
    )
}

pub fn squared_rank_probs(fitness: &[f64]) -> Vec<f64> {
    let n = fitness.len();

    normalize(
        ranks(fitness)
            .into_iter()
            .map(|rank| ((n - rank + 1) as f64).powi(2))
            .collect(),
    )
}
