use thiserror::Error;

use crate::keys::{CombinationKey, ExperimentKey, JobKey, ProjectKey};
use crate::phase::Phase;

/// Main error type for the fedgrid coordinator
#[derive(Error, Debug)]
pub enum FgError {
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("Worker RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FgError {
    /// Only individual worker call failures may be re-requested as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FgError::Rpc(RpcError::Request { .. }))
    }
}

/// Job submission errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Cluster mode attempted but no queue declared for {key}")]
    QueueNotConfigured { key: JobKey },

    #[error("Failed to connect to {phase} queue at {endpoint}: {message}")]
    Connect {
        phase: Phase,
        endpoint: String,
        message: String,
    },

    #[error("Failed to publish {phase} job for {key}: {message}")]
    Publish {
        key: JobKey,
        phase: Phase,
        message: String,
    },

    #[error("{phase} job failed for {key}: {message}")]
    JobFailed {
        key: JobKey,
        phase: Phase,
        message: String,
    },

    #[error("No inline runner registered for {phase} (requested for {key})")]
    RunnerMissing { key: JobKey, phase: Phase },
}

/// Feature alignment errors
#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("Feature drift detected for participant '{participant_id}' under {key}")]
    FeatureDrift {
        key: ProjectKey,
        participant_id: String,
    },

    #[error("Model shape of {key} may not change while auto-alignment is disabled")]
    ModelMutationForbidden { key: ProjectKey },

    #[error("No archived alignment for participant '{participant_id}' under {key}")]
    MissingAlignment {
        key: ProjectKey,
        participant_id: String,
    },

    #[error("Experiment {key} has no declared model")]
    MissingExperiment { key: ExperimentKey },
}

/// Worker RPC errors
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Request to participant '{participant_id}' for {key} failed: {message}")]
    Request {
        key: JobKey,
        participant_id: String,
        message: String,
    },

    #[error("Malformed response from participant '{participant_id}' for {key}: {message}")]
    MalformedResponse {
        key: JobKey,
        participant_id: String,
        message: String,
    },

    #[error("Inference references reference unknown worker '{worker_id}' for {key}")]
    UnknownWorker { key: CombinationKey, worker_id: String },
}

/// Experiment tracking errors
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Tracking experiment for {key} has not been initialised")]
    ExperimentNotInitialised { key: ExperimentKey },

    #[error("Tracking run for {key} has not been initialised")]
    RunNotInitialised { key: CombinationKey },

    #[error("Tracking service at {uri} failed: {message}")]
    Service { uri: String, message: String },
}

/// Hyperparameter search errors
#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("Hyperparameter search for {key} is only active in cluster mode")]
    StandaloneUnsupported { key: ExperimentKey },

    #[error("Trial {key} timed out waiting for participants {pending:?}")]
    TrialTimeout {
        key: CombinationKey,
        pending: Vec<String>,
    },

    #[error("Unsupported metric '{metric}'")]
    UnsupportedMetric { metric: String },

    #[error("Invalid search space: {message}")]
    InvalidSearchSpace { message: String },
}

/// Result type alias for fedgrid operations
pub type FgResult<T> = Result<T, FgError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::FgError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::FgError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::FgError::Config(format!($($arg)*))
    };
}
