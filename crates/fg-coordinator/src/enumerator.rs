use std::collections::BTreeMap;
use std::sync::Arc;

use fg_archive::Archive;
use fg_optimizer::is_search_run;
use fg_types::{
    validation_error, CombinationEnumerator, CombinationKey, DatasetMeta, EnumerationRequest,
    ExperimentKey, FgError, FgResult, JobParameters, Phase,
};
use tracing::debug;

/// Enumerates the experiment x run cross product from archived run records.
///
/// Named runs are taken as given. Without named runs every archived run of
/// the experiment is used, except those a hyperparameter search generated.
pub struct ArchiveEnumerator {
    archive: Arc<dyn Archive>,
}

impl ArchiveEnumerator {
    pub fn new(archive: Arc<dyn Archive>) -> Self {
        Self { archive }
    }

    fn runs_of(&self, experiment: &ExperimentKey, named: &[String]) -> FgResult<Vec<CombinationKey>> {
        if !named.is_empty() {
            return Ok(named.iter().map(|run_id| experiment.run(run_id.clone())).collect());
        }
        Ok(self
            .archive
            .read_runs(experiment)?
            .into_iter()
            .map(|run| run.key)
            .filter(|key| !is_search_run(&key.run_id))
            .collect())
    }

    fn parameters(
        &self,
        phase: Phase,
        key: &CombinationKey,
        request: &EnumerationRequest,
    ) -> FgResult<JobParameters> {
        let experiment = key.expt_id.clone();
        let run = key.run_id.clone();
        let flags = request.flags.clone();
        match phase {
            Phase::Train => Ok(JobParameters::Train {
                action: request.action,
                experiment,
                run,
                flags,
            }),
            Phase::Evaluate => Ok(JobParameters::Evaluate {
                action: request.action,
                experiment,
                run,
                participants: request.participants.clone(),
                metas: vec![DatasetMeta::Evaluate],
                flags,
            }),
            Phase::Optimize => {
                let hyperparameters = self
                    .archive
                    .read_run(key)?
                    .map(|record| record.hyperparameters)
                    .unwrap_or_default();
                Ok(JobParameters::Optimize {
                    action: request.action,
                    experiment,
                    run,
                    hyperparameters,
                    flags,
                })
            }
            Phase::Align | Phase::Predict => Err(validation_error!(
                "{} jobs are not enumerated per run",
                phase
            )),
        }
    }
}

impl CombinationEnumerator for ArchiveEnumerator {
    fn enumerate(
        &self,
        request: &EnumerationRequest,
    ) -> Result<BTreeMap<CombinationKey, JobParameters>, FgError> {
        let [phase] = request.phases.as_slice() else {
            return Err(validation_error!(
                "enumeration covers exactly one phase, got {:?}",
                request.phases
            ));
        };
        if request.experiments.is_empty() {
            return Err(validation_error!(
                "no experiments named for collaboration '{}' project '{}'",
                request.collab_id,
                request.project_id
            ));
        }

        let mut combinations = BTreeMap::new();
        for expt_id in &request.experiments {
            let experiment =
                ExperimentKey::new(&request.collab_id, &request.project_id, expt_id.as_str());
            for key in self.runs_of(&experiment, &request.runs)? {
                let parameters = self.parameters(*phase, &key, request)?;
                combinations.insert(key, parameters);
            }
        }
        debug!(
            collab_id = %request.collab_id,
            project_id = %request.project_id,
            phase = %phase,
            combinations = combinations.len(),
            "Enumerated combinations"
        );
        Ok(combinations)
    }
}
