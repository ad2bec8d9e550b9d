use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::keys::{CombinationKey, ExperimentKey};

/// Machine learning task a federated cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Classify,
    Regress,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Regress => "regress",
        }
    }
}

/// One layer of an experiment's model architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub l_type: String,
    #[serde(default)]
    pub is_input: bool,
    #[serde(default)]
    pub structure: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
}

/// Model architecture declared for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSchema {
    pub key: ExperimentKey,
    pub model: Vec<LayerSpec>,
}

impl ExperimentSchema {
    pub fn new(key: ExperimentKey, model: Vec<LayerSpec>) -> Self {
        Self { key, model }
    }

    pub fn input_size(&self) -> Option<u64> {
        self.model
            .first()
            .and_then(|layer| layer.structure.get("in_features"))
            .and_then(Value::as_u64)
    }

    pub fn output_size(&self) -> Option<u64> {
        self.model
            .last()
            .and_then(|layer| layer.structure.get("out_features"))
            .and_then(Value::as_u64)
    }

    /// Rewrite the declared input/output sizes. Returns true if anything
    /// changed.
    pub fn set_io_sizes(&mut self, in_features: u64, out_features: u64) -> bool {
        let before = (self.input_size(), self.output_size());
        if let Some(first) = self.model.first_mut() {
            first
                .structure
                .insert("in_features".to_string(), Value::from(in_features));
        }
        if let Some(last) = self.model.last_mut() {
            last.structure
                .insert("out_features".to_string(), Value::from(out_features));
        }
        before != (self.input_size(), self.output_size())
    }
}

pub type Hyperparameters = BTreeMap<String, Value>;

/// A run: one hyperparameter assignment for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub key: CombinationKey,
    pub hyperparameters: Hyperparameters,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(key: CombinationKey, hyperparameters: Hyperparameters) -> Self {
        Self {
            key,
            hyperparameters,
            created_at: Utc::now(),
        }
    }
}

/// Checkpoint and loss history produced by one model origin.
///
/// Loss histories are JSON files: the global history maps
/// `{meta: {round: loss}}`, local histories map `{epoch: loss}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifacts {
    pub origin: String,
    pub path: PathBuf,
    pub loss_history: PathBuf,
}

/// Output of a training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub key: CombinationKey,
    pub global: ModelArtifacts,
    #[serde(default)]
    pub local: BTreeMap<String, ModelArtifacts>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ExperimentSchema {
        let model: Vec<LayerSpec> = serde_json::from_value(json!([
            {
                "is_input": true,
                "structure": {"in_features": 15, "out_features": 100, "bias": true},
                "l_type": "Linear",
                "activation": "sigmoid"
            },
            {
                "is_input": false,
                "structure": {"in_features": 100, "out_features": 1, "bias": true},
                "l_type": "Linear",
                "activation": "sigmoid"
            }
        ]))
        .unwrap();
        ExperimentSchema::new(ExperimentKey::new("c", "p", "e"), model)
    }

    #[test]
    fn io_sizes_read_first_and_last_layer() {
        let schema = schema();
        assert_eq!(schema.input_size(), Some(15));
        assert_eq!(schema.output_size(), Some(1));
    }

    #[test]
    fn set_io_sizes_reports_changes() {
        let mut schema = schema();
        assert!(!schema.set_io_sizes(15, 1));
        assert!(schema.set_io_sizes(28, 1));
        assert_eq!(schema.input_size(), Some(28));
        // Hidden dimensions untouched
        assert_eq!(schema.model[0].structure["out_features"], json!(100));
    }
}
