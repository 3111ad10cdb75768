use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_yaml::Value;
use thiserror::Error;

#[cfg(test)]
mod gene_test;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeneError {
    #[error("expected a [digit, order] pair, found {0:?}")]
    MalformedNumber(Value),
    #[error("zero value for a non-zero gene")]
    Zero,
    #[error("negative digit {0} for a positive gene")]
    Negative(i64),
    #[error("digit {digit} outside of [-{limit}, {limit}]")]
    DigitOutOfRange { digit: i64, limit: i64 },
    #[error("order {order} outside of [{min}, {max}]")]
    OrderOutOfRange { order: i32, min: i32, max: i32 },
    #[error("{0:?} is not a power of two")]
    NotPowerOfTwo(Value),
    #[error("power {power} outside of [{min}, {max}]")]
    PowerOutOfRange { power: u32, min: u32, max: u32 },
    #[error("{0:?} is not part of the domain")]
    NotInDomain(Value),
    #[error("invalid gene declaration: {0}")]
    InvalidSpec(String),
}

/// The move a mutation applied last, stored per gene so that a successful
/// direction can be tried again on the offspring.
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Momentum {
    IncreaseOrder = 0,
    DecreaseOrder = 1,
    IncreaseDigit = 2,
    DecreaseDigit = 3,
    HalvePower = 4,
    DoublePower = 5,
    Resample = 6,
}

/// Declaration of a single gene as found in the gene template
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "gtype")]
pub enum GeneSpec {
    #[serde(rename = "number")]
    Number(NumberSpec),
    #[serde(rename = "ptwo")]
    PowerOfTwo(PowerSpec),
    #[serde(rename = "set")]
    Set(SetSpec),
}

/// `digit * 10^order` with bounded order and digit magnitude
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NumberSpec {
    #[serde(default = "yes")]
    pub avoid_zero: bool,
    #[serde(default = "yes")]
    pub positive: bool,
    #[serde(default)]
    pub min_order: i32,
    #[serde(default = "default_max_order")]
    pub max_order: i32,
    // number of decimal digits allowed for `digit`
    #[serde(default = "default_precision")]
    pub precision: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PowerSpec {
    #[serde(default)]
    pub min_power: u32,
    #[serde(default = "default_max_power")]
    pub max_power: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SetSpec {
    pub domain: Vec<Value>,
}

/// Current value of a gene
#[derive(Clone, Debug, PartialEq)]
pub enum Allele {
    Number { digit: i64, order: i32 },
    PowerOfTwo { power: u32 },
    Member(Value),
}

const NUMBER_MOVES: [Momentum; 4] = [
    Momentum::IncreaseOrder,
    Momentum::DecreaseOrder,
    Momentum::IncreaseDigit,
    Momentum::DecreaseDigit,
];

fn yes() -> bool {
    true
}

fn default_max_order() -> i32 {
    5
}

fn default_precision() -> u32 {
    1
}

fn default_max_power() -> u32 {
    10
}

/// `digit * 10^order`
pub fn to_number(digit: i64, order: i32) -> f64 {
    digit as f64 * 10f64.powi(order)
}

impl NumberSpec {
    fn limit(&self) -> i64 {
        10i64.pow(self.precision) - 1
    }

    fn check(&self, digit: i64, order: i32) -> Result<(), GeneError> {
        let limit = self.limit();

        if self.avoid_zero && digit == 0 {
            Err(GeneError::Zero)
        } else if self.positive && digit < 0 {
            Err(GeneError::Negative(digit))
        } else if digit > limit || digit < -limit {
            Err(GeneError::DigitOutOfRange { digit, limit })
        } else if order < self.min_order || order > self.max_order {
            Err(GeneError::OrderOutOfRange {
                order,
                min: self.min_order,
                max: self.max_order,
            })
        } else {
            Ok(())
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (i64, i32) {
        let max_limit = 10i64.pow(self.precision);
        let min_limit = match (self.positive, self.avoid_zero) {
            (true, true) => 1,
            (true, false) => 0,
            (false, _) => 1 - max_limit,
        };

        let mut digit = rng.gen_range(min_limit..max_limit);
        while self.avoid_zero && digit == 0 {
            digit = rng.gen_range(min_limit..max_limit);
        }

        (digit, rng.gen_range(self.min_order..=self.max_order))
    }

    fn can_move(&self, digit: i64, order: i32) -> bool {
        NUMBER_MOVES
            .iter()
            .any(|step| self.step(digit, order, *step).is_some())
    }

    /// Result of applying `step`, if the bounds allow it
    fn step(&self, digit: i64, order: i32, step: Momentum) -> Option<(i64, i32)> {
        let limit = self.limit();

        match step {
            Momentum::IncreaseOrder if order < self.max_order => Some((digit, order + 1)),
            Momentum::DecreaseOrder if order > self.min_order => Some((digit, order - 1)),
            Momentum::IncreaseDigit if digit < limit => {
                Some((digit + if digit == -1 && self.avoid_zero { 2 } else { 1 }, order))
            }
            Momentum::DecreaseDigit if !self.positive && digit > -limit => {
                Some((digit - if digit == 1 && self.avoid_zero { 2 } else { 1 }, order))
            }
            Momentum::DecreaseDigit if (!self.avoid_zero && digit > 0) || digit > 1 => {
                Some((digit - 1, order))
            }
            _ => None,
        }
    }

    /// Apply one of the four moves, retrying the `momentum` move first.
    ///
    /// The sample picks the first move to try (quarters of [0, 1)); a move
    /// that is not applicable at a boundary falls through to the next one and
    /// the sample is re-rolled if none of them fired.
    fn mutate<R: Rng + ?Sized>(
        &self,
        digit: i64,
        order: i32,
        momentum: Option<Momentum>,
        rng: &mut R,
    ) -> (i64, i32, Option<Momentum>) {
        if let Some((digit, order)) = momentum.and_then(|step| self.step(digit, order, step)) {
            return (digit, order, momentum);
        }
        if !self.can_move(digit, order) {
            return (digit, order, None);
        }

        loop {
            let sample: f64 = rng.gen();
            let first = ((sample * 4.0) as usize).min(NUMBER_MOVES.len() - 1);

            for step in NUMBER_MOVES[first..].iter() {
                if let Some((digit, order)) = self.step(digit, order, *step) {
                    return (digit, order, Some(*step));
                }
            }
        }
    }
}

impl PowerSpec {
    fn check(&self, power: u32) -> Result<(), GeneError> {
        if power < self.min_power || power > self.max_power {
            Err(GeneError::PowerOutOfRange {
                power,
                min: self.min_power,
                max: self.max_power,
            })
        } else {
            Ok(())
        }
    }

    /// Nudge the exponent by one, going down half of the time unless already
    /// at the floor.
    fn mutate<R: Rng + ?Sized>(
        &self,
        power: u32,
        momentum: Option<Momentum>,
        rng: &mut R,
    ) -> (u32, Option<Momentum>) {
        if self.min_power >= self.max_power {
            return (power, None);
        }

        let halve = (power > self.min_power).then(|| (power - 1, Some(Momentum::HalvePower)));
        let double = (power < self.max_power).then(|| (power + 1, Some(Momentum::DoublePower)));

        match (momentum, halve, double) {
            (Some(Momentum::HalvePower), Some(step), _) | (Some(Momentum::DoublePower), _, Some(step)) => step,
            (_, Some(step), _) if rng.gen_bool(0.5) => step,
            (_, _, Some(step)) => step,
            (_, Some(step), None) => step,
            (_, None, None) => (power, None),
        }
    }
}

impl GeneSpec {
    /// Reject declarations no value could ever satisfy
    pub fn validate(&self) -> Result<(), GeneError> {
        match self {
            Self::Number(spec) => {
                if spec.min_order > spec.max_order {
                    Err(GeneError::InvalidSpec(format!(
                        "min_order {} is larger than max_order {}",
                        spec.min_order, spec.max_order
                    )))
                } else if spec.precision == 0 || spec.precision > 18 {
                    Err(GeneError::InvalidSpec(format!(
                        "precision must be within [1, 18], found {}",
                        spec.precision
                    )))
                } else {
                    Ok(())
                }
            }
            Self::PowerOfTwo(spec) => {
                if spec.min_power > spec.max_power || spec.max_power > 62 {
                    Err(GeneError::InvalidSpec(format!(
                        "power range [{}, {}] is not valid",
                        spec.min_power, spec.max_power
                    )))
                } else {
                    Ok(())
                }
            }
            Self::Set(spec) => {
                if spec.domain.is_empty() {
                    Err(GeneError::InvalidSpec("empty domain".to_string()))
                } else if let Some(repeated) = spec.domain.iter().duplicates().next() {
                    Err(GeneError::InvalidSpec(format!("{repeated:?} appears twice in the domain")))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Read a raw document value into an allele of this gene, validating it
    pub fn decode(&self, value: &Value) -> Result<Allele, GeneError> {
        let allele = match self {
            Self::Number(_) => match value.as_sequence().map(Vec::as_slice) {
                Some([digit, order]) => match (digit.as_i64(), order.as_i64()) {
                    (Some(digit), Some(order)) => Allele::Number {
                        digit,
                        order: i32::try_from(order)
                            .map_err(|_| GeneError::MalformedNumber(value.clone()))?,
                    },
                    _ => return Err(GeneError::MalformedNumber(value.clone())),
                },
                _ => return Err(GeneError::MalformedNumber(value.clone())),
            },
            Self::PowerOfTwo(_) => match value.as_u64() {
                Some(raw) if raw.is_power_of_two() => Allele::PowerOfTwo {
                    power: raw.trailing_zeros(),
                },
                _ => return Err(GeneError::NotPowerOfTwo(value.clone())),
            },
            Self::Set(_) => Allele::Member(value.clone()),
        };

        self.check(&allele)?;

        Ok(allele)
    }

    pub fn check(&self, allele: &Allele) -> Result<(), GeneError> {
        match (self, allele) {
            (Self::Number(spec), Allele::Number { digit, order }) => spec.check(*digit, *order),
            (Self::PowerOfTwo(spec), Allele::PowerOfTwo { power }) => spec.check(*power),
            (Self::Set(spec), Allele::Member(value)) => {
                if spec.domain.contains(value) {
                    Ok(())
                } else {
                    Err(GeneError::NotInDomain(value.clone()))
                }
            }
            (_, other) => Err(GeneError::NotInDomain(other.to_value())),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Allele {
        match self {
            Self::Number(spec) => {
                let (digit, order) = spec.sample(rng);
                Allele::Number { digit, order }
            }
            Self::PowerOfTwo(spec) => Allele::PowerOfTwo {
                power: rng.gen_range(spec.min_power..=spec.max_power),
            },
            Self::Set(spec) => Allele::Member(spec.domain[rng.gen_range(0..spec.domain.len())].clone()),
        }
    }

    /// Mutate `allele`, retrying the move recorded in `momentum` first.
    ///
    /// Returns the new allele together with the move that produced it; the
    /// move is `None` when the gene is pinned by its bounds.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        allele: &Allele,
        momentum: Option<Momentum>,
        rng: &mut R,
    ) -> (Allele, Option<Momentum>) {
        match (self, allele) {
            (Self::Number(spec), Allele::Number { digit, order }) => {
                let (digit, order, momentum) = spec.mutate(*digit, *order, momentum, rng);
                (Allele::Number { digit, order }, momentum)
            }
            (Self::PowerOfTwo(spec), Allele::PowerOfTwo { power }) => {
                let (power, momentum) = spec.mutate(*power, momentum, rng);
                (Allele::PowerOfTwo { power }, momentum)
            }
            (Self::Set(spec), Allele::Member(current)) => {
                if spec.domain.len() <= 1 {
                    return (allele.clone(), Some(Momentum::Resample));
                }

                let mut candidate = &spec.domain[rng.gen_range(0..spec.domain.len())];
                while candidate == current {
                    candidate = &spec.domain[rng.gen_range(0..spec.domain.len())];
                }

                (Allele::Member(candidate.clone()), Some(Momentum::Resample))
            }
            // mismatched kinds can only come from a genotype that skipped
            // decoding, start over from a fresh sample
            _ => (self.sample(rng), Some(Momentum::Resample)),
        }
    }
}

impl Allele {
    /// Raw genotype representation, the inverse of `GeneSpec::decode`
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number { digit, order } => {
                Value::Sequence(vec![Value::from(*digit), Value::from(*order)])
            }
            Self::PowerOfTwo { power } => Value::from(1u64 << power),
            Self::Member(value) => value.clone(),
        }
    }

    /// Value as seen by the experiment script
    pub fn express(&self) -> Value {
        match self {
            Self::Number { digit, order } => {
                if *order >= 0 {
                    match 10i64
                        .checked_pow(*order as u32)
                        .and_then(|scale| scale.checked_mul(*digit))
                    {
                        Some(value) => Value::from(value),
                        None => Value::from(to_number(*digit, *order)),
                    }
                } else {
                    Value::from(to_number(*digit, *order))
                }
            }
            Self::PowerOfTwo { power } => Value::from(1u64 << power),
            Self::Member(value) => value.clone(),
        }
    }
}
