use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keys::WorkerKey;
use crate::phase::DatasetMeta;

/// A statistic reported by a worker: a scalar for regression metrics or one
/// value per class for classification metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl StatValue {
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Scalar(value) => vec![*value],
            Self::Series(values) => values.clone(),
        }
    }
}

/// Inference statistics for one participant and one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceStatistics {
    #[serde(default)]
    pub statistics: BTreeMap<String, StatValue>,
    #[serde(default)]
    pub res_path: Option<String>,
}

impl InferenceStatistics {
    pub fn is_empty(&self) -> bool {
        self.statistics.is_empty() && self.res_path.is_none()
    }
}

pub type MetaStatistics = BTreeMap<DatasetMeta, InferenceStatistics>;

/// Statistics keyed by participant id.
pub type ParticipantStatistics = BTreeMap<String, MetaStatistics>;

/// Inference result references a worker produced, per partition.
pub type InferenceRefs = BTreeMap<DatasetMeta, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceKind {
    Validation,
    Prediction,
}

/// Archived statistics of one participant for one combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub key: WorkerKey,
    pub kind: InferenceKind,
    pub statistics: MetaStatistics,
    pub created_at: DateTime<Utc>,
}

impl StatisticsRecord {
    pub fn new(key: WorkerKey, kind: InferenceKind, statistics: MetaStatistics) -> Self {
        Self {
            key,
            kind,
            statistics,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_values_accept_scalars_and_series() {
        let parsed: BTreeMap<String, StatValue> =
            serde_json::from_str(r#"{"accuracy": [0.5, 0.75], "R2": 0.9}"#).unwrap();
        assert_eq!(parsed["accuracy"], StatValue::Series(vec![0.5, 0.75]));
        assert_eq!(parsed["R2"].values(), vec![0.9]);
    }

    #[test]
    fn inference_statistics_parse_worker_payload() {
        let raw = r#"{"res_path": "/out/inference.json", "statistics": {"f_score": [0.1, 0.2]}}"#;
        let stats: InferenceStatistics = serde_json::from_str(raw).unwrap();
        assert_eq!(stats.res_path.as_deref(), Some("/out/inference.json"));
        assert!(!stats.is_empty());
        assert!(InferenceStatistics::default().is_empty());
    }
}
