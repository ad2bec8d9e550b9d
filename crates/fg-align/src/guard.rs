use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fg_archive::Archive;
use fg_rpc::{HeadersRequest, WorkerRpc};
use fg_types::{
    Action, AlignmentError, DatasetHeaders, DatasetMeta, ExperimentKey, ExperimentSchema, FgResult,
    Grid, ProjectKey, SpacerIndices,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::mfa::FeatureSuperset;

/// One alignment pass over a grid.
#[derive(Debug, Clone)]
pub struct AlignmentRequest {
    pub key: ProjectKey,
    pub action: Action,
    pub grid: Grid,
    /// Participants whose alignment may change in this pass. Every other
    /// participant must recompute to exactly its archived alignment.
    pub triggers: BTreeSet<String>,
    /// Partitions a trigger's declaration covers.
    pub declared_metas: Vec<DatasetMeta>,
    /// Experiments whose model shape follows the superset when `auto_fix`.
    pub experiments: Vec<ExperimentKey>,
    pub auto_align: bool,
    pub auto_fix: bool,
}

impl AlignmentRequest {
    /// Full project alignment: everyone is a trigger for every partition.
    pub fn project(
        key: ProjectKey,
        action: Action,
        grid: Grid,
        experiments: Vec<ExperimentKey>,
        auto_align: bool,
        auto_fix: bool,
    ) -> Self {
        let triggers = grid.participants().into_iter().collect();
        Self {
            key,
            action,
            grid,
            triggers,
            declared_metas: DatasetMeta::ALL.to_vec(),
            experiments,
            auto_align,
            auto_fix,
        }
    }
}

/// Verified outcome of an alignment pass. Nothing is archived until the
/// plan is committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignmentPlan {
    pub key: Option<ProjectKey>,
    /// Effective alignment of every grid participant after the pass.
    pub spacers: BTreeMap<String, SpacerIndices>,
    /// Alignments to archive (triggers only).
    pub updates: BTreeMap<String, SpacerIndices>,
    /// Experiment schemas whose declared sizes changed.
    pub experiments: Vec<ExperimentSchema>,
}

/// Write a verified plan's alignment updates and schema changes.
pub fn commit_plan(archive: &dyn Archive, plan: &AlignmentPlan) -> FgResult<()> {
    if let Some(key) = &plan.key {
        archive.write_alignments(key, &plan.updates)?;
    }
    for schema in &plan.experiments {
        archive.write_experiment(schema.clone())?;
    }
    Ok(())
}

/// Computes alignments and rejects feature drift.
pub struct AlignmentGuard {
    rpc: Arc<dyn WorkerRpc>,
    archive: Arc<dyn Archive>,
}

impl AlignmentGuard {
    pub fn new(rpc: Arc<dyn WorkerRpc>, archive: Arc<dyn Archive>) -> Self {
        Self { rpc, archive }
    }

    pub async fn align(&self, request: &AlignmentRequest) -> FgResult<AlignmentPlan> {
        if !request.auto_align {
            if request.auto_fix {
                error!(
                    collab_id = %request.key.collab_id,
                    project_id = %request.key.project_id,
                    "Model mutation requested without auto-alignment"
                );
                return Err(AlignmentError::ModelMutationForbidden {
                    key: request.key.clone(),
                }
                .into());
            }
            return self.stored_plan(request);
        }

        let headers = self.poll_all_headers(request).await?;
        let superset = FeatureSuperset::from_headers(headers.values());
        let fresh = superset.align_all(&headers);
        let archived = self.archive.read_alignments(&request.key)?;

        // Every comparison must pass before anything is planned
        let mut drifted = Vec::new();
        for (participant_id, spacers) in &fresh {
            if request.triggers.contains(participant_id) {
                continue;
            }
            let matches = archived
                .get(participant_id)
                .map(|record| &record.spacers == spacers)
                .unwrap_or(false);
            if !matches {
                error!(
                    collab_id = %request.key.collab_id,
                    project_id = %request.key.project_id,
                    participant_id = %participant_id,
                    archived = archived.contains_key(participant_id),
                    "Feature drift detected"
                );
                drifted.push(participant_id.clone());
            }
        }
        if let Some(participant_id) = drifted.into_iter().next() {
            return Err(AlignmentError::FeatureDrift {
                key: request.key.clone(),
                participant_id,
            }
            .into());
        }

        let mut plan = AlignmentPlan {
            key: Some(request.key.clone()),
            ..Default::default()
        };
        for (participant_id, spacers) in fresh {
            if request.triggers.contains(&participant_id) {
                let updated = match archived.get(&participant_id) {
                    Some(record) => record.spacers.merged(&spacers, &request.declared_metas),
                    None => spacers,
                };
                plan.updates.insert(participant_id.clone(), updated.clone());
                plan.spacers.insert(participant_id, updated);
            } else {
                plan.spacers.insert(participant_id, spacers);
            }
        }

        if request.auto_fix {
            plan.experiments = self.fix_experiments(request, &superset)?;
        }

        info!(
            collab_id = %request.key.collab_id,
            project_id = %request.key.project_id,
            participants = plan.spacers.len(),
            updates = plan.updates.len(),
            experiments = plan.experiments.len(),
            "Alignment verified"
        );
        Ok(plan)
    }

    /// Archive a verified plan.
    pub fn commit(&self, plan: &AlignmentPlan) -> FgResult<()> {
        commit_plan(self.archive.as_ref(), plan)
    }

    fn stored_plan(&self, request: &AlignmentRequest) -> FgResult<AlignmentPlan> {
        let archived = self.archive.read_alignments(&request.key)?;
        let spacers = request
            .grid
            .iter()
            .map(|entry| {
                let spacers = entry
                    .alignment
                    .clone()
                    .or_else(|| {
                        archived
                            .get(&entry.participant_id)
                            .map(|record| record.spacers.clone())
                    })
                    .unwrap_or_default();
                (entry.participant_id.clone(), spacers)
            })
            .collect();

        debug!(
            collab_id = %request.key.collab_id,
            project_id = %request.key.project_id,
            "Auto-alignment disabled, reusing stored alignments"
        );
        Ok(AlignmentPlan {
            key: Some(request.key.clone()),
            spacers,
            ..Default::default()
        })
    }

    async fn poll_all_headers(
        &self,
        request: &AlignmentRequest,
    ) -> FgResult<BTreeMap<String, DatasetHeaders>> {
        let mut tasks = JoinSet::new();
        for entry in request.grid.iter().cloned() {
            let rpc = Arc::clone(&self.rpc);
            let key = request.key.clone();
            let body = HeadersRequest {
                action: request.action,
                tags: entry.tags.clone(),
            };
            tasks.spawn(async move {
                let headers = rpc.poll_headers(&key, &entry, &body).await;
                (entry.participant_id, headers)
            });
        }

        let mut collected = BTreeMap::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (participant_id, headers) =
                joined.map_err(|e| fg_types::internal_error!("header poll task failed: {}", e))?;
            match headers {
                Ok(headers) => {
                    collected.insert(participant_id, headers);
                }
                Err(e) => {
                    error!(participant_id = %participant_id, error = %e, "Header poll failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(collected),
        }
    }

    fn fix_experiments(
        &self,
        request: &AlignmentRequest,
        superset: &FeatureSuperset,
    ) -> FgResult<Vec<ExperimentSchema>> {
        let mut changed = Vec::new();
        for key in &request.experiments {
            let mut schema = self
                .archive
                .read_experiment(key)?
                .ok_or_else(|| AlignmentError::MissingExperiment { key: key.clone() })?;
            if schema.set_io_sizes(superset.input_size(), superset.output_size(request.action)) {
                debug!(
                    expt_id = %key.expt_id,
                    in_features = superset.input_size(),
                    out_features = superset.output_size(request.action),
                    "Experiment shape realigned"
                );
                changed.push(schema);
            }
        }
        Ok(changed)
    }
}
