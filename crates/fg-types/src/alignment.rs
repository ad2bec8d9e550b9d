use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::ProjectKey;
use crate::phase::DatasetMeta;

/// Superset positions a participant's dataset lacks, per axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisIndices {
    #[serde(rename = "X", default)]
    pub x: Vec<usize>,
    #[serde(default)]
    pub y: Vec<usize>,
}

/// Spacer indices of one participant for every dataset partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpacerIndices {
    #[serde(default)]
    pub train: AxisIndices,
    #[serde(default)]
    pub evaluate: AxisIndices,
    #[serde(default)]
    pub predict: AxisIndices,
}

impl SpacerIndices {
    pub fn get(&self, meta: DatasetMeta) -> &AxisIndices {
        match meta {
            DatasetMeta::Train => &self.train,
            DatasetMeta::Evaluate => &self.evaluate,
            DatasetMeta::Predict => &self.predict,
        }
    }

    pub fn set(&mut self, meta: DatasetMeta, indices: AxisIndices) {
        match meta {
            DatasetMeta::Train => self.train = indices,
            DatasetMeta::Evaluate => self.evaluate = indices,
            DatasetMeta::Predict => self.predict = indices,
        }
    }

    /// Copy of `self` where only `metas` are taken from `fresh`.
    pub fn merged(&self, fresh: &SpacerIndices, metas: &[DatasetMeta]) -> SpacerIndices {
        let mut merged = self.clone();
        for meta in metas {
            merged.set(*meta, fresh.get(*meta).clone());
        }
        merged
    }
}

/// Archived alignment of one participant within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub key: ProjectKey,
    pub participant_id: String,
    pub spacers: SpacerIndices,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlignmentRecord {
    pub fn new(key: ProjectKey, participant_id: impl Into<String>, spacers: SpacerIndices) -> Self {
        let now = Utc::now();
        Self {
            key,
            participant_id: participant_id.into(),
            spacers,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Column headers a worker reports for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaHeaders {
    #[serde(rename = "X", default)]
    pub x: Vec<String>,
    #[serde(default)]
    pub y: Vec<String>,
}

/// Headers of every partition a worker holds. Partitions without declared
/// tags come back empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHeaders {
    #[serde(default)]
    pub train: MetaHeaders,
    #[serde(default)]
    pub evaluate: MetaHeaders,
    #[serde(default)]
    pub predict: MetaHeaders,
}

impl DatasetHeaders {
    pub fn get(&self, meta: DatasetMeta) -> &MetaHeaders {
        match meta {
            DatasetMeta::Train => &self.train,
            DatasetMeta::Evaluate => &self.evaluate,
            DatasetMeta::Predict => &self.predict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_touches_declared_metas() {
        let mut archived = SpacerIndices::default();
        archived.train = AxisIndices { x: vec![0], y: vec![] };
        archived.predict = AxisIndices { x: vec![3], y: vec![] };

        let mut fresh = SpacerIndices::default();
        fresh.train = AxisIndices { x: vec![9], y: vec![9] };
        fresh.predict = AxisIndices { x: vec![1, 2], y: vec![] };

        let merged = archived.merged(&fresh, &[DatasetMeta::Predict]);
        assert_eq!(merged.train, archived.train);
        assert_eq!(merged.predict, fresh.predict);
    }

    #[test]
    fn axis_indices_use_capital_x() {
        let json = serde_json::to_value(AxisIndices { x: vec![1], y: vec![2] }).unwrap();
        assert_eq!(json, serde_json::json!({"X": [1], "y": [2]}));
    }
}
