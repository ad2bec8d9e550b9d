//! # fg-optimizer
//!
//! Hyperparameter search over federated cycles.
//!
//! Each trial is an ordinary train + evaluate cycle on a synthetic run,
//! dispatched through the cluster queues. The coordinator blocks on a
//! completion barrier until every participant's validation statistics are
//! archived, then reports the aggregated metric back to the search strategy.

mod barrier;
mod coordinator;
mod metrics;
mod resources;
mod search;
mod trial;
mod tuner;

pub use barrier::CompletionBarrier;
pub use coordinator::{TrialContext, TrialCoordinator, TrialExecutor};
pub use metrics::{aggregate_metric, summarise, SearchMetric};
pub use resources::{TrialAllocation, TrialResources};
pub use search::{
    strategy_from_name, to_hyperparameters, Assignment, BayesianSearch, GridSearch, ParameterDef,
    ParameterKind, ParameterValue, RandomSearch, SearchSpace, SearchStrategy,
};
pub use trial::{
    is_search_run, new_search_run_id, parse_duration, ObjectiveDirection, Trial, TrialResult,
    TrialStatus, TuningConfig, TuningState, TuningStatus, SEARCH_RUN_PREFIX,
};
pub use tuner::Tuner;
