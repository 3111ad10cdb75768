use crate::{
    constraints::ConstraintError,
    gene::{Allele, GeneError, Momentum},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("gene `{name}`: {source}")]
    Gene { name: String, source: GeneError },
    #[error("unknown gene `{0}`")]
    UnknownGene(String),
    #[error("missing gene `{0}`")]
    MissingGene(String),
    #[error("invalid gene template: {0}")]
    InvalidTemplate(String),
    #[error("genotype document is not a mapping")]
    NotAMapping,
    #[error("constraint error")]
    Constraint(#[from] ConstraintError),
    #[error("failed to (de)serialize genotype")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to access genotype file")]
    Io(#[from] std::io::Error),
}

/// How a genotype came to be
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Sample,
    Mutation,
    Crossover,
    Manual,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Origin>,
    // fitness of the genotype this one was mutated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fitness: Option<f64>,
    // gene changed by the mutation that produced this genotype
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub momentum: BTreeMap<String, Momentum>,
}

/// Named alleles keyed by their dotted path in the configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Genotype {
    pub genes: BTreeMap<String, Allele>,
    pub meta: Meta,
}

impl Genotype {
    pub fn new(genes: BTreeMap<String, Allele>, source: Origin) -> Self {
        Self {
            genes,
            meta: Meta {
                source: Some(source),
                ..Meta::default()
            },
        }
    }

    pub fn get(&self, name: &str) -> Option<&Allele> {
        self.genes.get(name)
    }
}
