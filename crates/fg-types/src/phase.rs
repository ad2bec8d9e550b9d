use serde::{Deserialize, Serialize};
use std::fmt;

/// Federated job phase. Each phase owns one logical queue in cluster mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Align,
    Train,
    Evaluate,
    Predict,
    Optimize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Align,
        Phase::Train,
        Phase::Evaluate,
        Phase::Predict,
        Phase::Optimize,
    ];

    /// Name of the queue that consumers of this phase subscribe to.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::Align => "align",
            Self::Train => "train",
            Self::Evaluate => "evaluate",
            Self::Predict => "predict",
            Self::Optimize => "optimize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Dataset partition held by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetMeta {
    Train,
    Evaluate,
    Predict,
}

impl DatasetMeta {
    pub const ALL: [DatasetMeta; 3] = [DatasetMeta::Train, DatasetMeta::Evaluate, DatasetMeta::Predict];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Evaluate => "evaluate",
            Self::Predict => "predict",
        }
    }
}

impl fmt::Display for DatasetMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
