//! Trial tracking and tuning run management.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fg_types::{config_error, FgError};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::resources::{TrialAllocation, TrialResources};
use crate::search::Assignment;

/// Prefix marking a run as generated by hyperparameter search.
pub const SEARCH_RUN_PREFIX: &str = "optim_run_";

pub fn new_search_run_id() -> String {
    format!("{}{}", SEARCH_RUN_PREFIX, Uuid::new_v4())
}

pub fn is_search_run(run_id: &str) -> bool {
    run_id.starts_with(SEARCH_RUN_PREFIX)
}

/// Parse space-separated durations such as `"1h 30m"`. Units are `s`, `m`,
/// `h`, `d` and `w`. Invalid input yields `None`, i.e. no time budget.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let mut total = 0u64;
    for token in raw.split_whitespace() {
        let Some((split, _)) = token.char_indices().last() else {
            continue;
        };
        let (amount, unit) = token.split_at(split);
        let per_unit = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            _ => {
                warn!(duration = raw, "Invalid duration declared, running without a time budget");
                return None;
            }
        };
        let Ok(amount) = amount.parse::<u64>() else {
            warn!(duration = raw, "Invalid duration declared, running without a time budget");
            return None;
        };
        total += amount * per_unit;
    }
    (total > 0).then(|| Duration::from_secs(total))
}

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl FromStr for ObjectiveDirection {
    type Err = FgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" | "maximize" => Ok(Self::Maximize),
            "min" | "minimize" => Ok(Self::Minimize),
            other => Err(config_error!("unknown optimize mode '{}'", other)),
        }
    }
}

/// How a search over one experiment is run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// `grid`, `random` or `bayesian`.
    pub strategy: String,
    pub max_trials: usize,
    /// How many trials may be in flight at once.
    pub concurrency: usize,
    /// Stop launching trials once this much time has passed.
    pub max_exec_duration: Option<Duration>,
    /// Search metric the objective is taken from.
    pub metric: String,
    pub direction: ObjectiveDirection,
    /// Exploration weight for Bayesian search (ignored for grid/random).
    pub exploration_weight: f64,
    /// Number of steps per continuous dimension for grid search.
    pub grid_steps: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            strategy: "random".to_string(),
            max_trials: 10,
            concurrency: 1,
            max_exec_duration: parse_duration("1h"),
            metric: "accuracy".to_string(),
            direction: ObjectiveDirection::Maximize,
            exploration_weight: 0.3,
            grid_steps: 5,
        }
    }
}

impl TuningConfig {
    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = strategy.to_string();
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_max_exec_duration(mut self, duration: &str) -> Self {
        self.max_exec_duration = parse_duration(duration);
        self
    }
}

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuningState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningStatus {
    pub config: TuningConfig,
    pub allocation: TrialAllocation,
    pub state: TuningState,
    pub trials: Vec<Trial>,
    pub best_trial: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TuningStatus {
    pub fn new(config: TuningConfig, allocation: TrialAllocation) -> Self {
        Self {
            config,
            allocation,
            state: TuningState::Pending,
            trials: Vec::new(),
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = TuningState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = TuningState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TuningState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }

    pub fn trial_mut(&mut self, number: usize) -> Option<&mut Trial> {
        self.trials.iter_mut().find(|t| t.number == number)
    }

    /// Update the best trial if `result` improves on the current best.
    pub fn update_best(&mut self, result: &TrialResult) {
        let improves = match &self.best_trial {
            None => true,
            Some(current_best) => match self.config.direction {
                ObjectiveDirection::Maximize => result.objective > current_best.objective,
                ObjectiveDirection::Minimize => result.objective < current_best.objective,
            },
        };
        if improves {
            self.best_trial = Some(result.clone());
        }
    }
}

/// One assignment evaluated as a federated cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub parameters: Assignment,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(number: usize, parameters: Assignment) -> Self {
        Self {
            number,
            parameters,
            status: TrialStatus::Running,
            result: None,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_completed(&mut self, result: TrialResult) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Running,
    Completed,
    Failed,
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Search run the trial was archived under.
    pub run_id: String,
    pub objective: f64,
    /// Every search metric the participants reported, aggregated.
    pub metrics: BTreeMap<String, f64>,
    pub parameters: Assignment,
    pub resources: TrialResources,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;
    use fg_types::ResourceBudget;

    fn result(objective: f64) -> TrialResult {
        TrialResult {
            run_id: new_search_run_id(),
            objective,
            metrics: BTreeMap::new(),
            parameters: Assignment::new(),
            resources: TrialResources { cpus: 1.0, gpus: 0.0 },
            duration_ms: 10,
        }
    }

    fn status(direction: ObjectiveDirection) -> TuningStatus {
        let budget = ResourceBudget { cores: 4.0, gpus: 0.0 };
        TuningStatus::new(
            TuningConfig::default().with_objective("accuracy", direction),
            TrialAllocation::new(&budget, 2),
        )
    }

    #[test]
    fn durations_parse_in_mixed_units() {
        assert_eq!(parse_duration("1h 30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("45s 1w"), Some(Duration::from_secs(604_845)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn search_runs_are_recognisable() {
        let run_id = new_search_run_id();
        assert!(is_search_run(&run_id));
        assert!(!run_id.trim_start_matches(SEARCH_RUN_PREFIX).starts_with(SEARCH_RUN_PREFIX));
        assert!(!is_search_run("run_1"));
    }

    #[test]
    fn optimize_modes_parse() {
        assert_eq!("max".parse::<ObjectiveDirection>().unwrap(), ObjectiveDirection::Maximize);
        assert_eq!("Min".parse::<ObjectiveDirection>().unwrap(), ObjectiveDirection::Minimize);
        assert!("sideways".parse::<ObjectiveDirection>().is_err());
    }

    #[test]
    fn best_trial_tracking_maximize() {
        let mut status = status(ObjectiveDirection::Maximize);
        status.update_best(&result(0.6));
        status.update_best(&result(0.8));
        status.update_best(&result(0.7));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 0.8);
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let mut status = status(ObjectiveDirection::Minimize);
        status.update_best(&result(0.15));
        status.update_best(&result(0.05));
        status.update_best(&result(0.10));
        assert_eq!(status.best_trial.as_ref().unwrap().objective, 0.05);
    }

    #[test]
    fn trial_lifecycle() {
        let mut params = Assignment::new();
        params.insert("rounds".into(), ParameterValue::Int(5));

        let mut status = status(ObjectiveDirection::Maximize);
        status.mark_running();
        status.trials.push(Trial::new(0, params.clone()));
        status.trials.push(Trial::new(1, params));
        assert_eq!(status.count(TrialStatus::Running), 2);

        status.trial_mut(0).unwrap().mark_completed(result(0.9));
        status.trial_mut(1).unwrap().mark_failed("worker crashed".into());
        assert_eq!(status.count(TrialStatus::Completed), 1);
        assert_eq!(status.count(TrialStatus::Failed), 1);
        assert_eq!(status.trials[1].error.as_deref(), Some("worker crashed"));

        status.mark_completed();
        assert_eq!(status.state, TuningState::Completed);
        assert!(status.finished_at.is_some());
    }
}
