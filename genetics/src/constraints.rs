use crate::gene::Allele;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::trace;


/// Default bound on the number of propagation steps
pub const DEFAULT_MAX_STEPS: usize = 100;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("constraint propagation did not settle after {0} steps")]
    Overflow(usize),
    #[error("constraints on `{0}` force it back and forth between values")]
    Oscillation(String),
    #[error("constraint references unknown gene `{0}`")]
    UnknownVariable(String),
}

/// `variable == when` forces every `(dependent, value)` pair in `then`
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub when: Allele,
    pub then: Vec<(String, Allele)>,
}

#[derive(Clone, Debug)]
pub struct Constraints {
    rules: BTreeMap<String, Vec<Rule>>,
    max_steps: usize,
}

impl Constraints {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Build the rule set, rejecting rule chains that would flip a gene
    /// between two values forever.
    pub fn new(rules: BTreeMap<String, Vec<Rule>>, max_steps: usize) -> Result<Self, ConstraintError> {
        let constraints = Self { rules, max_steps };
        constraints.detect_oscillation()?;

        Ok(constraints)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn variables(&self) -> impl Iterator<Item = &String> {
        self.rules.keys().chain(
            self.rules
                .values()
                .flatten()
                .flat_map(|rule| rule.then.iter().map(|(name, _)| name)),
        )
    }

    /// Apply all rules breadth first until nothing changes.
    ///
    /// Assigning a gene the value it already holds is a no-op and does not
    /// queue its dependents again.
    pub fn propagate(&self, genes: &mut BTreeMap<String, Allele>) -> Result<usize, ConstraintError> {
        let mut queue: VecDeque<&str> = self.rules.keys().map(String::as_str).collect();
        let mut steps = 0;

        while let Some(variable) = queue.pop_front() {
            if steps >= self.max_steps {
                return Err(ConstraintError::Overflow(steps));
            }
            steps += 1;

            let (Some(rules), Some(current)) = (self.rules.get(variable), genes.get(variable)) else {
                continue;
            };

            if let Some(rule) = rules.iter().find(|rule| &rule.when == current) {
                for (dependent, forced) in rule.then.iter() {
                    if genes.get(dependent) != Some(forced) {
                        trace!(variable, dependent = %dependent, "constraint forced a new value");
                        genes.insert(dependent.clone(), forced.clone());
                        queue.push_back(dependent);
                    }
                }
            }
        }

        Ok(steps)
    }

    fn successors(&self, variable: &str, value: &Allele) -> Vec<(&str, &Allele)> {
        self.rules
            .get(variable)
            .and_then(|rules| rules.iter().find(|rule| &rule.when == value))
            .map(|rule| {
                rule.then
                    .iter()
                    .map(|(name, forced)| (name.as_str(), forced))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reachable<'a>(&'a self, start: (&'a str, &'a Allele)) -> Vec<(&'a str, &'a Allele)> {
        let mut seen: Vec<(&str, &Allele)> = Vec::new();
        let mut stack = self.successors(start.0, start.1);

        while let Some(node) = stack.pop() {
            if !seen.contains(&node) {
                seen.push(node);
                stack.extend(self.successors(node.0, node.1));
            }
        }

        seen
    }

    /// A gene oscillates when assigning it `x` eventually forces it to `y`
    /// and `y` leads back to `x`.
    fn detect_oscillation(&self) -> Result<(), ConstraintError> {
        for (variable, rules) in self.rules.iter() {
            for rule in rules {
                let start = (variable.as_str(), &rule.when);

                for (other, other_value) in self.reachable(start) {
                    if other == variable.as_str()
                        && other_value != &rule.when
                        && self.reachable((other, other_value)).contains(&start)
                    {
                        return Err(ConstraintError::Oscillation(variable.clone()));
                    }
                }
            }
        }

        Ok(())
    }
}
