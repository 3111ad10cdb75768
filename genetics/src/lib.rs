//! Gene-typed configuration variants and the operators used to evolve them.
//!
//! A gene template is a YAML document whose leaves carry a `gtype` tag
//! (`number`, `ptwo` or `set`). The [`mutator::Mutator`] built from it samples,
//! mutates and crosses [`genotype::Genotype`]s, keeps them consistent with the
//! declared constraints and expands them into phenotypes that are merged onto
//! a default configuration.

pub mod constraints;
pub mod gene;
pub mod genotype;
pub mod mutator;
pub mod phenotype;
pub mod selection;

pub use constraints::{ConstraintError, Constraints};
pub use gene::{Allele, GeneError, GeneSpec, Momentum};
pub use genotype::{Genotype, GenotypeError, Meta, Origin};
pub use mutator::Mutator;
pub use selection::Selection;
