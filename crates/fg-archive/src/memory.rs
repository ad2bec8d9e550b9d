use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use dashmap::DashMap;
use fg_types::{
    AlignmentRecord, CombinationKey, ExperimentKey, ExperimentSchema, FgError, FgResult,
    InferenceKind, MappingKey, MetaTags, ModelRecord, ProjectKey, RunRecord, SpacerIndices,
    StatisticsRecord, TrackingMapping, WorkerKey,
};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::store::Archive;

type ParticipantKey = (ProjectKey, String);

/// In-process archive backed by concurrent maps.
#[derive(Debug)]
pub struct MemoryArchive {
    // One lock so a batch of alignments lands atomically.
    alignments: RwLock<HashMap<ParticipantKey, AlignmentRecord>>,
    tags: DashMap<ParticipantKey, MetaTags>,
    experiments: DashMap<ExperimentKey, ExperimentSchema>,
    runs: DashMap<CombinationKey, RunRecord>,
    models: DashMap<CombinationKey, ModelRecord>,
    statistics: DashMap<(InferenceKind, WorkerKey), StatisticsRecord>,
    mappings: DashMap<MappingKey, TrackingMapping>,
    stats: RwLock<ArchiveStats>,
    revision: watch::Sender<u64>,
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArchive {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            alignments: RwLock::new(HashMap::new()),
            tags: DashMap::new(),
            experiments: DashMap::new(),
            runs: DashMap::new(),
            models: DashMap::new(),
            statistics: DashMap::new(),
            mappings: DashMap::new(),
            stats: RwLock::new(ArchiveStats::default()),
            revision,
        }
    }

    pub fn stats(&self) -> ArchiveStats {
        self.stats.read().clone()
    }

    fn record_write(&self, overwritten: bool) {
        {
            let mut stats = self.stats.write();
            stats.writes += 1;
            if overwritten {
                stats.overwrites += 1;
            }
        }
        self.revision.send_modify(|revision| *revision += 1);
    }
}

impl Archive for MemoryArchive {
    fn read_alignment(
        &self,
        key: &ProjectKey,
        participant_id: &str,
    ) -> FgResult<Option<AlignmentRecord>> {
        let alignments = self.alignments.read();
        Ok(alignments
            .get(&(key.clone(), participant_id.to_string()))
            .cloned())
    }

    fn read_alignments(&self, key: &ProjectKey) -> FgResult<BTreeMap<String, AlignmentRecord>> {
        let alignments = self.alignments.read();
        Ok(alignments
            .iter()
            .filter(|((project, _), _)| project == key)
            .map(|((_, participant_id), record)| (participant_id.clone(), record.clone()))
            .collect())
    }

    fn write_alignments(
        &self,
        key: &ProjectKey,
        alignments: &BTreeMap<String, SpacerIndices>,
    ) -> FgResult<()> {
        if alignments.is_empty() {
            return Ok(());
        }

        let overwritten = {
            let mut stored = self.alignments.write();
            let now = Utc::now();
            let mut overwritten = false;
            for (participant_id, spacers) in alignments {
                let slot = (key.clone(), participant_id.clone());
                match stored.get_mut(&slot) {
                    Some(record) => {
                        record.spacers = spacers.clone();
                        record.updated_at = now;
                        overwritten = true;
                    }
                    None => {
                        stored.insert(
                            slot,
                            AlignmentRecord::new(key.clone(), participant_id.clone(), spacers.clone()),
                        );
                    }
                }
            }
            overwritten
        };

        debug!(
            collab_id = %key.collab_id,
            project_id = %key.project_id,
            participants = alignments.len(),
            "Archived alignments"
        );
        self.record_write(overwritten);
        Ok(())
    }

    fn read_tags(&self, key: &ProjectKey, participant_id: &str) -> FgResult<Option<MetaTags>> {
        Ok(self
            .tags
            .get(&(key.clone(), participant_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn write_tags(&self, key: &ProjectKey, participant_id: &str, tags: MetaTags) -> FgResult<()> {
        let previous = self
            .tags
            .insert((key.clone(), participant_id.to_string()), tags);
        self.record_write(previous.is_some());
        Ok(())
    }

    fn read_experiment(&self, key: &ExperimentKey) -> FgResult<Option<ExperimentSchema>> {
        Ok(self.experiments.get(key).map(|entry| entry.value().clone()))
    }

    fn write_experiment(&self, schema: ExperimentSchema) -> FgResult<()> {
        let previous = self.experiments.insert(schema.key.clone(), schema);
        self.record_write(previous.is_some());
        Ok(())
    }

    fn write_run(&self, run: RunRecord) -> FgResult<()> {
        let previous = self.runs.insert(run.key.clone(), run);
        self.record_write(previous.is_some());
        Ok(())
    }

    fn read_run(&self, key: &CombinationKey) -> FgResult<Option<RunRecord>> {
        Ok(self.runs.get(key).map(|entry| entry.value().clone()))
    }

    fn read_runs(&self, key: &ExperimentKey) -> FgResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|entry| &entry.key().experiment() == key)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(runs)
    }

    fn write_model(&self, model: ModelRecord) -> FgResult<()> {
        let previous = self.models.insert(model.key.clone(), model);
        self.record_write(previous.is_some());
        Ok(())
    }

    fn read_model(&self, key: &CombinationKey) -> FgResult<Option<ModelRecord>> {
        Ok(self.models.get(key).map(|entry| entry.value().clone()))
    }

    fn write_statistics(&self, record: StatisticsRecord) -> FgResult<()> {
        let previous = self
            .statistics
            .insert((record.kind, record.key.clone()), record);
        self.record_write(previous.is_some());
        Ok(())
    }

    fn read_statistics(
        &self,
        kind: InferenceKind,
        key: &WorkerKey,
    ) -> FgResult<Option<StatisticsRecord>> {
        Ok(self
            .statistics
            .get(&(kind, key.clone()))
            .map(|entry| entry.value().clone()))
    }

    fn read_combination_statistics(
        &self,
        kind: InferenceKind,
        key: &CombinationKey,
    ) -> FgResult<BTreeMap<String, StatisticsRecord>> {
        Ok(self
            .statistics
            .iter()
            .filter(|entry| entry.key().0 == kind && &entry.key().1.combination == key)
            .map(|entry| (entry.key().1.participant_id.clone(), entry.value().clone()))
            .collect())
    }

    fn read_experiment_statistics(
        &self,
        kind: InferenceKind,
        key: &ExperimentKey,
    ) -> FgResult<Vec<StatisticsRecord>> {
        let mut records: Vec<StatisticsRecord> = self
            .statistics
            .iter()
            .filter(|entry| entry.key().0 == kind && &entry.key().1.combination.experiment() == key)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    fn read_mapping(&self, key: &MappingKey) -> FgResult<Option<TrackingMapping>> {
        Ok(self.mappings.get(key).map(|entry| entry.value().clone()))
    }

    fn create_mapping(&self, mapping: TrackingMapping) -> FgResult<TrackingMapping> {
        use dashmap::mapref::entry::Entry;

        match self.mappings.entry(mapping.key.clone()) {
            Entry::Occupied(_) => {
                return Err(FgError::Archive(format!(
                    "tracking mapping for {:?} already exists",
                    mapping.key
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(mapping.clone());
            }
        }
        self.record_write(false);
        Ok(mapping)
    }

    fn update_mapping_uri(&self, key: &MappingKey, uri: &str) -> FgResult<TrackingMapping> {
        let updated = {
            let mut entry = self
                .mappings
                .get_mut(key)
                .ok_or_else(|| FgError::Archive(format!("no tracking mapping for {:?}", key)))?;
            entry.uri = uri.to_string();
            entry.value().clone()
        };
        self.record_write(true);
        Ok(updated)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Write counters
#[derive(Debug, Clone, Default)]
pub struct ArchiveStats {
    pub writes: u64,
    pub overwrites: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_types::{AxisIndices, DatasetMeta, InferenceStatistics, TrackingDestination, TrackingKind};

    fn project() -> ProjectKey {
        ProjectKey::new("collab", "project")
    }

    fn spacers(x: Vec<usize>) -> SpacerIndices {
        let mut spacers = SpacerIndices::default();
        spacers.train = AxisIndices { x, y: vec![] };
        spacers
    }

    #[test]
    fn alignment_batch_preserves_creation_time() {
        let archive = MemoryArchive::new();
        let mut batch = BTreeMap::new();
        batch.insert("alice".to_string(), spacers(vec![1]));
        batch.insert("bob".to_string(), spacers(vec![]));
        archive.write_alignments(&project(), &batch).unwrap();

        let first = archive.read_alignment(&project(), "alice").unwrap().unwrap();

        let mut update = BTreeMap::new();
        update.insert("alice".to_string(), spacers(vec![2, 3]));
        archive.write_alignments(&project(), &update).unwrap();

        let second = archive.read_alignment(&project(), "alice").unwrap().unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.spacers.train.x, vec![2, 3]);
        assert_eq!(archive.read_alignments(&project()).unwrap().len(), 2);
        assert_eq!(archive.stats().overwrites, 1);
    }

    #[test]
    fn statistics_are_last_writer_wins() {
        let archive = MemoryArchive::new();
        let key = CombinationKey::new("c", "p", "e", "r");
        let mut stats = BTreeMap::new();
        stats.insert(DatasetMeta::Evaluate, InferenceStatistics::default());

        archive
            .write_statistics(StatisticsRecord::new(
                key.worker("alice"),
                InferenceKind::Validation,
                stats.clone(),
            ))
            .unwrap();
        archive
            .write_statistics(StatisticsRecord::new(
                key.worker("alice"),
                InferenceKind::Validation,
                stats,
            ))
            .unwrap();

        let all = archive
            .read_combination_statistics(InferenceKind::Validation, &key)
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(archive
            .read_combination_statistics(InferenceKind::Prediction, &key)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn mappings_are_created_once() {
        let archive = MemoryArchive::new();
        let key = MappingKey {
            collab_id: "c".into(),
            project_id: "p".into(),
            kind: TrackingKind::Experiment,
            record: "e".into(),
            destination: TrackingDestination::Local,
        };
        let mapping = TrackingMapping::new(key.clone(), "7", "c_>_p_>_e", "/tmp/mlruns");
        archive.create_mapping(mapping.clone()).unwrap();
        assert!(archive.create_mapping(mapping).is_err());

        let updated = archive.update_mapping_uri(&key, "/srv/mlruns").unwrap();
        assert_eq!(updated.tracking_id, "7");
        assert_eq!(updated.uri, "/srv/mlruns");
    }

    #[tokio::test]
    async fn writes_notify_subscribers() {
        let archive = MemoryArchive::new();
        let mut receiver = archive.subscribe();
        let before = *receiver.borrow_and_update();

        archive
            .write_tags(&project(), "alice", MetaTags::default())
            .unwrap();

        receiver.changed().await.unwrap();
        assert!(*receiver.borrow() > before);
    }
}
