use std::collections::BTreeMap;

use fg_types::{
    AlignmentRecord, CombinationKey, ExperimentKey, ExperimentSchema, FgResult, InferenceKind,
    MappingKey, MetaTags, ModelRecord, ProjectKey, RunRecord, SpacerIndices, StatisticsRecord,
    TrackingMapping, WorkerKey,
};
use tokio::sync::watch;

/// Keyed store for everything a federated cycle produces.
///
/// Writes to an existing key overwrite it (last writer wins). Every write
/// bumps a revision counter that waiters can subscribe to.
pub trait Archive: Send + Sync {
    fn read_alignment(
        &self,
        key: &ProjectKey,
        participant_id: &str,
    ) -> FgResult<Option<AlignmentRecord>>;

    fn read_alignments(&self, key: &ProjectKey) -> FgResult<BTreeMap<String, AlignmentRecord>>;

    /// Writes all alignments or none.
    fn write_alignments(
        &self,
        key: &ProjectKey,
        alignments: &BTreeMap<String, SpacerIndices>,
    ) -> FgResult<()>;

    fn read_tags(&self, key: &ProjectKey, participant_id: &str) -> FgResult<Option<MetaTags>>;

    fn write_tags(&self, key: &ProjectKey, participant_id: &str, tags: MetaTags) -> FgResult<()>;

    fn read_experiment(&self, key: &ExperimentKey) -> FgResult<Option<ExperimentSchema>>;

    fn write_experiment(&self, schema: ExperimentSchema) -> FgResult<()>;

    fn write_run(&self, run: RunRecord) -> FgResult<()>;

    fn read_run(&self, key: &CombinationKey) -> FgResult<Option<RunRecord>>;

    fn read_runs(&self, key: &ExperimentKey) -> FgResult<Vec<RunRecord>>;

    fn write_model(&self, model: ModelRecord) -> FgResult<()>;

    fn read_model(&self, key: &CombinationKey) -> FgResult<Option<ModelRecord>>;

    fn write_statistics(&self, record: StatisticsRecord) -> FgResult<()>;

    fn read_statistics(
        &self,
        kind: InferenceKind,
        key: &WorkerKey,
    ) -> FgResult<Option<StatisticsRecord>>;

    /// Statistics of every participant for one combination, keyed by
    /// participant id.
    fn read_combination_statistics(
        &self,
        kind: InferenceKind,
        key: &CombinationKey,
    ) -> FgResult<BTreeMap<String, StatisticsRecord>>;

    fn read_experiment_statistics(
        &self,
        kind: InferenceKind,
        key: &ExperimentKey,
    ) -> FgResult<Vec<StatisticsRecord>>;

    fn read_mapping(&self, key: &MappingKey) -> FgResult<Option<TrackingMapping>>;

    /// Fails if a mapping already exists for the key.
    fn create_mapping(&self, mapping: TrackingMapping) -> FgResult<TrackingMapping>;

    /// Replaces only the URI of an existing mapping.
    fn update_mapping_uri(&self, key: &MappingKey, uri: &str) -> FgResult<TrackingMapping>;

    /// Receiver that observes a new revision after every write.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
