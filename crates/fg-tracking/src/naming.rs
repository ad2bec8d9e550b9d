use fg_types::{
    CombinationKey, ExperimentKey, MappingKey, TrackingDestination, TrackingKind,
};

/// Separator between hierarchy levels in tracking names.
pub const NAME_SEPARATOR: &str = "_>_";

/// Tracking experiment name, unique across collaborations.
pub fn experiment_name(key: &ExperimentKey) -> String {
    [key.collab_id.as_str(), &key.project_id, &key.expt_id].join(NAME_SEPARATOR)
}

pub fn run_name(key: &CombinationKey) -> String {
    key.run_id.clone()
}

pub fn experiment_mapping_key(key: &ExperimentKey, destination: TrackingDestination) -> MappingKey {
    MappingKey {
        collab_id: key.collab_id.clone(),
        project_id: key.project_id.clone(),
        kind: TrackingKind::Experiment,
        record: key.expt_id.clone(),
        destination,
    }
}

pub fn run_mapping_key(key: &CombinationKey, destination: TrackingDestination) -> MappingKey {
    MappingKey {
        collab_id: key.collab_id.clone(),
        project_id: key.project_id.clone(),
        kind: TrackingKind::Run,
        record: [key.expt_id.as_str(), &key.run_id].join(NAME_SEPARATOR),
        destination,
    }
}
