use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{FgError, FgResult};
use crate::experiment::{Action, Hyperparameters};
use crate::grid::{DatasetTag, Grid};
use crate::keys::{CombinationKey, JobKey};
use crate::phase::{DatasetMeta, Phase};
use crate::validation_error;

fn default_true() -> bool {
    true
}

/// Behaviour switches shared by every phase of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFlags {
    #[serde(default = "default_true")]
    pub auto_align: bool,
    #[serde(default)]
    pub dockerised: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub log_msgs: bool,
}

impl Default for CycleFlags {
    fn default() -> Self {
        Self {
            auto_align: true,
            dockerised: false,
            verbose: false,
            log_msgs: false,
        }
    }
}

/// Phase-specific parameters of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum JobParameters {
    Align {
        action: Action,
        experiments: Vec<String>,
        #[serde(default = "default_true")]
        auto_align: bool,
        #[serde(default = "default_true")]
        auto_fix: bool,
    },
    Train {
        action: Action,
        experiment: String,
        run: String,
        #[serde(default)]
        flags: CycleFlags,
    },
    Evaluate {
        action: Action,
        experiment: String,
        run: String,
        participants: Vec<String>,
        metas: Vec<DatasetMeta>,
        #[serde(default)]
        flags: CycleFlags,
    },
    Predict {
        action: Action,
        experiment: String,
        run: String,
        participant_id: String,
        /// New predict tags per project id
        tags: BTreeMap<String, Vec<DatasetTag>>,
        #[serde(default)]
        flags: CycleFlags,
    },
    Optimize {
        action: Action,
        experiment: String,
        run: String,
        hyperparameters: Hyperparameters,
        #[serde(default)]
        flags: CycleFlags,
    },
}

impl JobParameters {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Align { .. } => Phase::Align,
            Self::Train { .. } => Phase::Train,
            Self::Evaluate { .. } => Phase::Evaluate,
            Self::Predict { .. } => Phase::Predict,
            Self::Optimize { .. } => Phase::Optimize,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Self::Align { action, .. }
            | Self::Train { action, .. }
            | Self::Evaluate { action, .. }
            | Self::Predict { action, .. }
            | Self::Optimize { action, .. } => *action,
        }
    }

    /// Reject malformed or incomplete parameters before anything is
    /// dispatched.
    pub fn validate(&self, phase: Phase, key: &JobKey) -> FgResult<()> {
        if self.phase() != phase {
            return Err(validation_error!(
                "{} parameters submitted as a {} job for {}",
                self.phase(),
                phase,
                key
            ));
        }

        match self {
            Self::Align {
                experiments,
                auto_align,
                auto_fix,
                ..
            } => {
                if key.combination().is_some() {
                    return Err(validation_error!(
                        "alignment works at project scope, got {}",
                        key
                    ));
                }
                if experiments.is_empty() {
                    return Err(validation_error!("no experiments to align for {}", key));
                }
                if *auto_fix && !*auto_align {
                    return Err(validation_error!(
                        "auto_fix requires auto_align for {}",
                        key
                    ));
                }
                Ok(())
            }
            Self::Train { experiment, run, .. } => {
                combination_matches(key, experiment, run).map(|_| ())
            }
            Self::Evaluate {
                experiment,
                run,
                participants,
                metas,
                ..
            } => {
                combination_matches(key, experiment, run)?;
                if participants.is_empty() {
                    return Err(validation_error!("no participants to evaluate for {}", key));
                }
                if metas.is_empty() {
                    return Err(validation_error!("no dataset metas requested for {}", key));
                }
                Ok(())
            }
            Self::Predict {
                experiment,
                run,
                participant_id,
                tags,
                ..
            } => {
                let combination = combination_matches(key, experiment, run)?;
                if participant_id.is_empty() {
                    return Err(validation_error!("prediction for {} names no participant", key));
                }
                if !tags.contains_key(&combination.project_id) {
                    return Err(validation_error!(
                        "participant '{}' declared no predict tags for {}",
                        participant_id,
                        key
                    ));
                }
                Ok(())
            }
            Self::Optimize { experiment, run, .. } => {
                combination_matches(key, experiment, run).map(|_| ())
            }
        }
    }
}

fn combination_matches<'a>(
    key: &'a JobKey,
    experiment: &str,
    run: &str,
) -> FgResult<&'a CombinationKey> {
    let combination = key
        .combination()
        .ok_or_else(|| validation_error!("{} is not a full combination key", key))?;
    if combination.expt_id != experiment || combination.run_id != run {
        return Err(validation_error!(
            "parameters for experiment '{}' run '{}' do not match {}",
            experiment,
            run,
            key
        ));
    }
    Ok(combination)
}

/// Message published to a phase queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub phase: Phase,
    pub key: JobKey,
    pub grid: Grid,
    pub parameters: JobParameters,
}

impl JobMessage {
    pub fn new(key: JobKey, grid: Grid, parameters: JobParameters) -> Self {
        Self {
            phase: parameters.phase(),
            key,
            grid,
            parameters,
        }
    }

    pub fn validate(&self) -> FgResult<()> {
        self.parameters.validate(self.phase, &self.key)
    }
}

/// Inputs to the combination enumerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationRequest {
    pub action: Action,
    pub collab_id: String,
    pub project_id: String,
    #[serde(default)]
    pub experiments: Vec<String>,
    #[serde(default)]
    pub runs: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub flags: CycleFlags,
}

/// Expands a request into individual combinations. Provided by the
/// surrounding system.
pub trait CombinationEnumerator: Send + Sync {
    fn enumerate(
        &self,
        request: &EnumerationRequest,
    ) -> Result<BTreeMap<CombinationKey, JobParameters>, FgError>;
}
