use crate::{
    constraints::{ConstraintError, Constraints, Rule},
    gene::{Allele, GeneSpec},
    genotype::{Genotype, GenotypeError, Meta, Origin},
    phenotype,
};
use rand::Rng;
use serde_yaml::{Mapping, Value};
use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    path::Path,
};
use tracing::debug;


/// Template keys that hold bookkeeping rather than genes
const RESERVED_KEYS: [&str; 2] = ["meta", "constraints"];

/// Samples, mutates and crosses genotypes of one gene template
#[derive(Clone, Debug)]
pub struct Mutator {
    genes: BTreeMap<String, GeneSpec>,
    constraints: Constraints,
}

fn key_str<'a>(key: &'a Value, context: &str) -> Result<&'a str, GenotypeError> {
    key.as_str()
        .ok_or_else(|| GenotypeError::InvalidTemplate(format!("non-string key {key:?} in {context}")))
}

fn decode_allele(
    genes: &BTreeMap<String, GeneSpec>,
    name: &str,
    value: &Value,
) -> Result<Allele, GenotypeError> {
    genes
        .get(name)
        .ok_or_else(|| ConstraintError::UnknownVariable(name.to_string()))?
        .decode(value)
        .map_err(|source| GenotypeError::Gene {
            name: name.to_string(),
            source,
        })
}

fn validate_genes(genes: &BTreeMap<String, GeneSpec>) -> Result<(), GenotypeError> {
    for (name, spec) in genes.iter() {
        spec.validate().map_err(|source| GenotypeError::Gene {
            name: name.clone(),
            source,
        })?;
    }

    Ok(())
}

impl Mutator {
    pub fn new(genes: BTreeMap<String, GeneSpec>, constraints: Constraints) -> Result<Self, GenotypeError> {
        if genes.is_empty() {
            return Err(GenotypeError::InvalidTemplate("no genes declared".to_string()));
        }

        validate_genes(&genes)?;

        if let Some(unknown) = constraints.variables().find(|name| !genes.contains_key(*name)) {
            return Err(ConstraintError::UnknownVariable(unknown.clone()).into());
        }

        Ok(Self { genes, constraints })
    }

    /// Collect every `gtype`-tagged leaf of `template` as a gene named by its
    /// dotted path, plus the optional top level `constraints` section:
    ///
    /// ```yaml
    /// optim:
    ///   name: {gtype: set, domain: [sgd, adam]}
    ///   lr: {gtype: number, min_order: -5, max_order: -1}
    /// constraints:
    ///   optim.name:
    ///     sgd: [{optim.lr: [1, -2]}]
    /// ```
    pub fn from_template(template: &Value, max_steps: usize) -> Result<Self, GenotypeError> {
        let root = template.as_mapping().ok_or(GenotypeError::NotAMapping)?;
        let mut genes = BTreeMap::new();
        let mut sections: VecDeque<(String, &Mapping)> = VecDeque::from([(String::new(), root)]);

        while let Some((prefix, section)) = sections.pop_front() {
            for (key, value) in section.iter() {
                let key = key_str(key, "gene template")?;

                if prefix.is_empty() && RESERVED_KEYS.contains(&key) {
                    continue;
                }
                if key.contains('.') {
                    return Err(GenotypeError::InvalidTemplate(format!(
                        "`{key}` contains a '.'"
                    )));
                }

                let path = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };

                match value.as_mapping() {
                    Some(mapping) if mapping.contains_key("gtype") => {
                        genes.insert(path, serde_yaml::from_value::<GeneSpec>(value.clone())?);
                    }
                    Some(mapping) => sections.push_back((path, mapping)),
                    None => {
                        return Err(GenotypeError::InvalidTemplate(format!(
                            "`{path}` is neither a gene nor a section"
                        )))
                    }
                }
            }
        }

        // constraint values are decoded with the gene specs
        validate_genes(&genes)?;
        let constraints = match root.get("constraints") {
            Some(section) => Self::parse_constraints(&genes, section, max_steps)?,
            None => Constraints::empty(),
        };

        Self::new(genes, constraints)
    }

    pub fn load(path: &Path, max_steps: usize) -> Result<Self, GenotypeError> {
        let template: Value = serde_yaml::from_str(&fs::read_to_string(path)?)?;

        Self::from_template(&template, max_steps)
    }

    fn parse_constraints(
        genes: &BTreeMap<String, GeneSpec>,
        section: &Value,
        max_steps: usize,
    ) -> Result<Constraints, GenotypeError> {
        let mut rules = BTreeMap::new();
        let section = section
            .as_mapping()
            .ok_or_else(|| GenotypeError::InvalidTemplate("constraints must be a mapping".to_string()))?;

        for (variable, cases) in section.iter() {
            let variable = key_str(variable, "constraints")?;
            let cases = cases.as_mapping().ok_or_else(|| {
                GenotypeError::InvalidTemplate(format!("constraints on `{variable}` must be a mapping"))
            })?;
            let mut variable_rules = Vec::new();

            for (when, forced) in cases.iter() {
                let mut then = Vec::new();

                for assignment in forced.as_sequence().into_iter().flatten() {
                    let assignment = assignment.as_mapping().ok_or_else(|| {
                        GenotypeError::InvalidTemplate(format!(
                            "constraints on `{variable}` must list {{gene: value}} mappings"
                        ))
                    })?;

                    for (dependent, value) in assignment.iter() {
                        let dependent = key_str(dependent, "constraints")?;
                        then.push((dependent.to_string(), decode_allele(genes, dependent, value)?));
                    }
                }

                variable_rules.push(Rule {
                    when: decode_allele(genes, variable, when)?,
                    then,
                });
            }

            rules.insert(variable.to_string(), variable_rules);
        }

        Ok(Constraints::new(rules, max_steps)?)
    }

    pub fn genes(&self) -> &BTreeMap<String, GeneSpec> {
        &self.genes
    }

    /// Validate a raw genotype document (dotted gene names plus an optional
    /// `meta` section) against the template.
    pub fn decode(&self, document: &Value) -> Result<Genotype, GenotypeError> {
        let mapping = document.as_mapping().ok_or(GenotypeError::NotAMapping)?;
        let mut genes = BTreeMap::new();
        let mut meta = Meta::default();

        for (key, value) in mapping.iter() {
            let name = key_str(key, "genotype")?;

            if name == "meta" {
                meta = serde_yaml::from_value(value.clone())?;
                continue;
            }

            let spec = self
                .genes
                .get(name)
                .ok_or_else(|| GenotypeError::UnknownGene(name.to_string()))?;
            let allele = spec.decode(value).map_err(|source| GenotypeError::Gene {
                name: name.to_string(),
                source,
            })?;

            genes.insert(name.to_string(), allele);
        }

        if let Some(missing) = self.genes.keys().find(|name| !genes.contains_key(*name)) {
            return Err(GenotypeError::MissingGene(missing.clone()));
        }

        Ok(Genotype { genes, meta })
    }

    pub fn encode(&self, genotype: &Genotype) -> Result<Value, GenotypeError> {
        let mut mapping = Mapping::new();

        for (name, allele) in genotype.genes.iter() {
            mapping.insert(Value::from(name.as_str()), allele.to_value());
        }
        mapping.insert(Value::from("meta"), serde_yaml::to_value(&genotype.meta)?);

        Ok(Value::Mapping(mapping))
    }

    pub fn read(&self, path: &Path) -> Result<Genotype, GenotypeError> {
        let document: Value = serde_yaml::from_str(&fs::read_to_string(path)?)?;

        self.decode(&document)
    }

    pub fn write(&self, path: &Path, genotype: &Genotype) -> Result<(), GenotypeError> {
        fs::write(path, serde_yaml::to_string(&self.encode(genotype)?)?)?;

        Ok(())
    }

    pub fn check(&self, genotype: &Genotype) -> Result<(), GenotypeError> {
        for (name, spec) in self.genes.iter() {
            let allele = genotype
                .get(name)
                .ok_or_else(|| GenotypeError::MissingGene(name.clone()))?;

            spec.check(allele).map_err(|source| GenotypeError::Gene {
                name: name.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// Force the genotype to satisfy the declared constraints
    pub fn constrain(&self, genotype: &mut Genotype) -> Result<(), ConstraintError> {
        self.constraints.propagate(&mut genotype.genes).map(|_| ())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Genotype, ConstraintError> {
        let genes = self
            .genes
            .iter()
            .map(|(name, spec)| (name.clone(), spec.sample(rng)))
            .collect();
        let mut genotype = Genotype::new(genes, Origin::Sample);

        self.constrain(&mut genotype)?;

        Ok(genotype)
    }

    /// Mutate a single gene of `parent`.
    ///
    /// With `follow_momentum` set and the parent having improved over its own
    /// parent, the gene changed last time is mutated again in the same
    /// direction. A parent that got worse loses the momentum of that gene.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        parent: &Genotype,
        parent_fitness: Option<f64>,
        follow_momentum: bool,
        rng: &mut R,
    ) -> Result<Genotype, ConstraintError> {
        let mut child = parent.clone();
        let previous = parent
            .meta
            .mutation
            .clone()
            .filter(|name| self.genes.contains_key(name));

        let (improved, worsened) = match (parent_fitness, parent.meta.parent_fitness) {
            (Some(fitness), Some(grandparent)) => (fitness > grandparent, fitness < grandparent),
            _ => (false, false),
        };

        if let (true, Some(name)) = (worsened, previous.as_ref()) {
            child.meta.momentum.remove(name);
        }

        let (name, momentum) = match previous.filter(|_| follow_momentum && improved) {
            Some(name) => {
                let momentum = child.meta.momentum.get(&name).copied();
                (name, momentum)
            }
            None => {
                let index = rng.gen_range(0..self.genes.len());
                (self.genes.keys().nth(index).cloned().unwrap_or_default(), None)
            }
        };

        if let Some(spec) = self.genes.get(&name) {
            let (allele, momentum) = match child.genes.get(&name) {
                Some(current) => spec.mutate(current, momentum, rng),
                None => (spec.sample(rng), None),
            };

            child.genes.insert(name.clone(), allele);
            match momentum {
                Some(momentum) => child.meta.momentum.insert(name.clone(), momentum),
                None => child.meta.momentum.remove(&name),
            };
        }

        child.meta.source = Some(Origin::Mutation);
        child.meta.parent_fitness = parent_fitness;
        child.meta.mutation = Some(name.clone());

        self.constrain(&mut child)?;
        debug!(gene = %name, "mutated genotype");

        Ok(child)
    }

    /// Uniform crossover: every gene comes from either parent with equal odds
    pub fn crossover<R: Rng + ?Sized>(
        &self,
        first: &Genotype,
        second: &Genotype,
        rng: &mut R,
    ) -> Result<Genotype, ConstraintError> {
        let genes = self
            .genes
            .keys()
            .filter_map(|name| {
                let from_second = rng.gen_bool(0.5);
                let allele = match (first.get(name), second.get(name)) {
                    (Some(_), Some(other)) if from_second => other,
                    (Some(own), _) => own,
                    (None, other) => other?,
                };

                Some((name.clone(), allele.clone()))
            })
            .collect();
        let mut child = Genotype::new(genes, Origin::Crossover);

        self.constrain(&mut child)?;
        debug!("combined two genotypes");

        Ok(child)
    }

    /// Configuration-shaped view of the genotype
    pub fn phenotype(&self, genotype: &Genotype) -> Value {
        phenotype::expand(genotype)
    }
}
