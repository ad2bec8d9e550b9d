use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingKind {
    Experiment,
    Run,
}

/// Which configured tracking destination a mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingDestination {
    Local,
    Remote,
}

/// Lookup key of a tracking mapping. `record` is the experiment id for
/// experiment mappings and `expt_>_run` for run mappings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingKey {
    pub collab_id: String,
    pub project_id: String,
    pub kind: TrackingKind,
    pub record: String,
    pub destination: TrackingDestination,
}

/// Link between a federated hierarchy level and an external tracking id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingMapping {
    pub key: MappingKey,
    /// Experiment id or run id in the tracking service. Never changes once
    /// created.
    pub tracking_id: String,
    /// Name the entity was created under in the tracking service.
    pub name: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
}

impl TrackingMapping {
    pub fn new(
        key: MappingKey,
        tracking_id: impl Into<String>,
        name: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            key,
            tracking_id: tracking_id.into(),
            name: name.into(),
            uri: uri.into(),
            created_at: Utc::now(),
        }
    }
}
