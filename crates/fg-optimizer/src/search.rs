//! Search space definitions and parameter sweep strategies.

use std::collections::BTreeMap;

use fg_types::{config_error, FgResult, Hyperparameters, OptimizationError};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Uniform range rounded to multiples of `q`.
    Quantized { low: f64, high: f64, q: f64 },
    /// Categorical choices.
    Choice { values: Vec<Value> },
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Json(Value),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&ParameterValue> for Value {
    fn from(value: &ParameterValue) -> Self {
        match value {
            ParameterValue::Float(v) => Value::from(*v),
            ParameterValue::Int(v) => Value::from(*v),
            ParameterValue::Json(v) => v.clone(),
        }
    }
}

/// One hyperparameter assignment, i.e. one trial's worth of values.
pub type Assignment = BTreeMap<String, ParameterValue>;

/// Hyperparameters recorded on a trial's run.
pub fn to_hyperparameters(assignment: &Assignment) -> Hyperparameters {
    assignment
        .iter()
        .map(|(name, value)| (name.clone(), Value::from(value)))
        .collect()
}

fn invalid(message: String) -> fg_types::FgError {
    OptimizationError::InvalidSearchSpace { message }.into()
}

fn quantize(value: f64, low: f64, high: f64, q: f64) -> f64 {
    ((value / q).round() * q).clamp(low, high)
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the declarative `{name: {"_type": .., "_value": [..]}}` format.
    ///
    /// `randint` upper bounds are exclusive, `quniform` takes
    /// `[low, high, q]`.
    pub fn from_tune_spec(raw: &Value) -> FgResult<Self> {
        let entries = raw
            .as_object()
            .ok_or_else(|| invalid("search space must be an object".into()))?;

        let mut space = Self::new();
        for (name, definition) in entries {
            let kind = definition
                .get("_type")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("'{}' declares no _type", name)))?;
            let values = definition
                .get("_value")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(format!("'{}' declares no _value list", name)))?;

            space = match kind {
                "choice" => {
                    if values.is_empty() {
                        return Err(invalid(format!("'{}' has no choices", name)));
                    }
                    space.add_choice(name.as_str(), values.clone())
                }
                "uniform" => {
                    let [low, high] = floats::<2>(name, values)?;
                    ordered(name, low, high)?;
                    space.add_float(name.as_str(), low, high)
                }
                "loguniform" => {
                    let [low, high] = floats::<2>(name, values)?;
                    ordered(name, low, high)?;
                    if low <= 0.0 {
                        return Err(invalid(format!("'{}' needs a positive lower bound", name)));
                    }
                    space.add_log_uniform(name.as_str(), low, high)
                }
                "quniform" => {
                    let [low, high, q] = floats::<3>(name, values)?;
                    ordered(name, low, high)?;
                    if q <= 0.0 {
                        return Err(invalid(format!("'{}' needs a positive step", name)));
                    }
                    space.add_quantized(name.as_str(), low, high, q)
                }
                "randint" => {
                    let [low, high] = floats::<2>(name, values)?;
                    let (low, high) = (low as i64, high as i64);
                    if high <= low {
                        return Err(invalid(format!("'{}' has an empty integer range", name)));
                    }
                    space.add_int(name.as_str(), low, high - 1)
                }
                other => {
                    return Err(invalid(format!(
                        "'{}' uses unsupported type '{}'",
                        name, other
                    )))
                }
            };
        }
        Ok(space)
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_quantized(mut self, name: impl Into<String>, low: f64, high: f64, q: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Quantized { low, high, q },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid, or the count overflows).
    pub fn grid_size(&self) -> Option<usize> {
        self.grid_points(None)
    }

    /// Grid points once continuous dimensions are split into `float_steps`
    /// points. `None` when a dimension has no grid or the count overflows.
    fn grid_points(&self, float_steps: Option<usize>) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => int_steps(*low, *high)?,
                ParameterKind::Quantized { low, high, q } => quantized_steps(*low, *high, *q),
                ParameterKind::Choice { values } => values.len(),
                ParameterKind::FloatRange { .. } | ParameterKind::LogUniform { .. } => float_steps?,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }
}

fn floats<const N: usize>(name: &str, values: &[Value]) -> FgResult<[f64; N]> {
    if values.len() != N {
        return Err(invalid(format!(
            "'{}' expects {} bounds, got {}",
            name,
            N,
            values.len()
        )));
    }
    let mut bounds = [0.0; N];
    for (slot, value) in bounds.iter_mut().zip(values) {
        *slot = value
            .as_f64()
            .ok_or_else(|| invalid(format!("'{}' has a non-numeric bound {}", name, value)))?;
    }
    Ok(bounds)
}

fn ordered(name: &str, low: f64, high: f64) -> FgResult<()> {
    if low > high {
        return Err(invalid(format!("'{}' has low {} above high {}", name, low, high)));
    }
    Ok(())
}

fn int_steps(low: i64, high: i64) -> Option<usize> {
    let span = high.checked_sub(low)?.checked_add(1)?;
    usize::try_from(span).ok()
}

fn quantized_steps(low: f64, high: f64, q: f64) -> usize {
    ((high - low) / q + 1e-9).floor() as usize + 1
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy: Send + Sync {
    /// Generate the next batch of assignments. Fewer than `count` means the
    /// strategy is exhausted.
    fn suggest(&mut self, count: usize) -> Vec<Assignment>;

    /// Report completed trial results so adaptive strategies can learn.
    fn report(&mut self, _params: &Assignment, _objective: f64) {}

    fn name(&self) -> &str;
}

/// Build a strategy by name: `grid`, `random` or `bayesian`.
pub fn strategy_from_name(
    name: &str,
    space: SearchSpace,
    exploration_weight: f64,
    grid_steps: usize,
) -> FgResult<Box<dyn SearchStrategy>> {
    match name.to_ascii_lowercase().as_str() {
        "grid" => Ok(Box::new(GridSearch::new(space, grid_steps)?)),
        "random" => Ok(Box::new(RandomSearch::new(space))),
        "bayesian" => Ok(Box::new(BayesianSearch::new(space, exploration_weight))),
        other => Err(config_error!("unknown search strategy '{}'", other)),
    }
}

// ---- Grid search ----

/// Largest grid a search will materialise.
pub const MAX_GRID_POINTS: usize = 100_000;

/// Exhaustive grid search over discrete parameter combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<Assignment>,
}

impl GridSearch {
    /// `float_steps` points are taken along each continuous dimension.
    /// Grids above [`MAX_GRID_POINTS`] are rejected before any point is
    /// built.
    pub fn new(space: SearchSpace, float_steps: usize) -> FgResult<Self> {
        match space.grid_points(Some(float_steps.max(2))) {
            Some(points) if points <= MAX_GRID_POINTS => Ok(Self {
                cursor: 0,
                combos: Self::build_grid(&space, float_steps),
            }),
            Some(points) => Err(invalid(format!(
                "grid of {} points exceeds the limit of {}",
                points, MAX_GRID_POINTS
            ))),
            None => Err(invalid(format!(
                "grid exceeds the limit of {} points",
                MAX_GRID_POINTS
            ))),
        }
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<Assignment> {
        let steps = float_steps.max(2);
        let spread = |i: usize| i as f64 / (steps - 1) as f64;

        let mut result: Vec<Assignment> = vec![Assignment::new()];
        for param in &space.parameters {
            let axis: Vec<ParameterValue> = match &param.kind {
                ParameterKind::FloatRange { low, high } => (0..steps)
                    .map(|i| ParameterValue::Float(low + spread(i) * (high - low)))
                    .collect(),
                ParameterKind::IntRange { low, high } => {
                    (*low..=*high).map(ParameterValue::Int).collect()
                }
                ParameterKind::LogUniform { low, high } => {
                    let (log_low, log_high) = (low.ln(), high.ln());
                    (0..steps)
                        .map(|i| {
                            ParameterValue::Float((log_low + spread(i) * (log_high - log_low)).exp())
                        })
                        .collect()
                }
                ParameterKind::Quantized { low, high, q } => (0..quantized_steps(*low, *high, *q))
                    .map(|i| ParameterValue::Float(quantize(low + i as f64 * q, *low, *high, *q)))
                    .collect(),
                ParameterKind::Choice { values } => {
                    values.iter().cloned().map(ParameterValue::Json).collect()
                }
            };

            // Cartesian product
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.insert(param.name.clone(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        let end = (self.cursor + count).min(self.combos.len());
        let batch = self.combos[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self { space }
    }

    fn sample_param(param: &ParameterDef) -> ParameterValue {
        let mut rng = rand::rng();
        match &param.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(rng.random_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => {
                ParameterValue::Int(rng.random_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp())
            }
            ParameterKind::Quantized { low, high, q } => {
                ParameterValue::Float(quantize(rng.random_range(*low..=*high), *low, *high, *q))
            }
            ParameterKind::Choice { values } => {
                ParameterValue::Json(values.choose(&mut rng).cloned().unwrap_or(Value::Null))
            }
        }
    }

    fn sample_one(&self) -> Assignment {
        self.space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), Self::sample_param(param)))
            .collect()
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (surrogate-model stub) ----

/// Bayesian-flavoured search: explores at random with probability
/// `exploration_weight`, otherwise perturbs the best reported assignment.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    observations: Vec<(Assignment, f64)>,
    exploration_weight: f64,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, exploration_weight: f64) -> Self {
        Self {
            space,
            observations: Vec::new(),
            exploration_weight,
        }
    }

    fn explore(&self) -> Assignment {
        RandomSearch::new(self.space.clone()).sample_one()
    }

    /// Perturb the best-known point.
    fn exploit(&self) -> Assignment {
        let best = self
            .observations
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let Some((base, _)) = best else {
            return self.explore();
        };

        let mut rng = rand::rng();
        let mut perturbed = Assignment::new();
        for param in &self.space.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.random_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.random_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.random_range(-0.1..0.1) * (high.ln() - low.ln());
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                (ParameterKind::Quantized { low, high, q }, Some(ParameterValue::Float(v))) => {
                    let noise = rng.random_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float(quantize(v + noise, *low, *high, *q))
                }
                // Choices and missing bases are resampled
                _ => RandomSearch::sample_param(param),
            };
            perturbed.insert(param.name.clone(), value);
        }
        perturbed
    }
}

impl SearchStrategy for BayesianSearch {
    fn suggest(&mut self, count: usize) -> Vec<Assignment> {
        (0..count)
            .map(|_| {
                let explore = self.observations.is_empty()
                    || rand::rng().random::<f64>() < self.exploration_weight;
                if explore {
                    self.explore()
                } else {
                    self.exploit()
                }
            })
            .collect()
    }

    fn report(&mut self, params: &Assignment, objective: f64) {
        self.observations.push((params.clone(), objective));
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
