use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fg_align::{AlignmentGuard, AlignmentPlan, AlignmentRequest};
use fg_analyser::Analyser;
use fg_archive::Archive;
use fg_rpc::WorkerRpc;
use fg_types::{
    validation_error, Action, CombinationKey, CycleFlags, DatasetMeta, ExperimentSchema, FgResult,
    Grid, Hyperparameters, InferenceRefs, JobKey, JobParameters, MetaTags, ModelRecord, Phase,
    ParticipantStatistics, ProjectKey, RunRecord,
};
use tracing::info;

/// Everything a trainer needs for one federated training cycle.
#[derive(Debug, Clone)]
pub struct TrainingTask {
    pub key: CombinationKey,
    pub action: Action,
    pub grid: Grid,
    pub experiment: ExperimentSchema,
    pub hyperparameters: Hyperparameters,
    pub flags: CycleFlags,
    pub out_dir: PathBuf,
}

/// Federated training routine, provided by the surrounding system.
#[async_trait]
pub trait FederatedTrainer: Send + Sync {
    async fn train(&self, task: &TrainingTask) -> FgResult<ModelRecord>;
}

#[derive(Debug, Clone)]
pub struct InferenceTask {
    pub key: CombinationKey,
    pub action: Action,
    pub grid: Grid,
    pub model: ModelRecord,
    pub participants: Vec<String>,
    pub metas: Vec<DatasetMeta>,
    pub flags: CycleFlags,
    pub out_dir: PathBuf,
}

/// Federated inference routine, provided by the surrounding system.
/// Returns inference references keyed by worker id.
#[async_trait]
pub trait FederatedInference: Send + Sync {
    async fn infer(&self, task: &InferenceTask) -> FgResult<BTreeMap<String, InferenceRefs>>;
}

/// Result of one executed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Alignment(AlignmentPlan),
    Training(ModelRecord),
    Validation(ParticipantStatistics),
    Prediction {
        participant_id: String,
        tags: MetaTags,
        alignment: AlignmentPlan,
        statistics: ParticipantStatistics,
    },
    Optimization {
        run: RunRecord,
        model: ModelRecord,
        validation: ParticipantStatistics,
    },
}

/// In-process execution of one phase.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(&self, key: &JobKey, grid: &Grid, parameters: &JobParameters)
        -> FgResult<JobOutput>;
}

/// Shared collaborators of the standard runners.
#[derive(Clone)]
pub struct RunnerContext {
    pub archive: Arc<dyn Archive>,
    pub rpc: Arc<dyn WorkerRpc>,
    pub trainer: Arc<dyn FederatedTrainer>,
    pub inference: Arc<dyn FederatedInference>,
    pub out_dir: PathBuf,
}

impl RunnerContext {
    /// Grid carrying the archived alignment of every participant.
    fn aligned_grid(&self, key: &ProjectKey, grid: &Grid) -> FgResult<Grid> {
        let archived = self.archive.read_alignments(key)?;
        let spacers: BTreeMap<String, _> = archived
            .into_iter()
            .map(|(participant_id, record)| (participant_id, record.spacers))
            .collect();
        Ok(grid.with_alignments(&spacers))
    }

    fn model_for(&self, key: &CombinationKey) -> FgResult<ModelRecord> {
        self.archive
            .read_model(key)?
            .ok_or_else(|| validation_error!("no trained model archived for {}", key))
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_statistics(
        &self,
        key: &CombinationKey,
        action: Action,
        grid: &Grid,
        participants: Vec<String>,
        metas: Vec<DatasetMeta>,
        flags: &CycleFlags,
    ) -> FgResult<ParticipantStatistics> {
        let task = InferenceTask {
            key: key.clone(),
            action,
            grid: grid.clone(),
            model: self.model_for(key)?,
            participants,
            metas: metas.clone(),
            flags: flags.clone(),
            out_dir: key.result_dir(&self.out_dir),
        };
        let inferences = self.inference.infer(&task).await?;
        Analyser::new(Arc::clone(&self.rpc), metas, flags.auto_align)
            .poll(key, action, grid, &inferences)
            .await
    }
}

fn combination(key: &JobKey) -> FgResult<&CombinationKey> {
    key.combination()
        .ok_or_else(|| validation_error!("{} is not a full combination key", key))
}

fn unexpected(phase: Phase, parameters: &JobParameters) -> fg_types::FgError {
    validation_error!("{} runner received {} parameters", phase, parameters.phase())
}

/// Project-wide multiple feature alignment.
pub struct AlignmentJob {
    context: RunnerContext,
}

impl AlignmentJob {
    pub fn new(context: RunnerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobRunner for AlignmentJob {
    fn phase(&self) -> Phase {
        Phase::Align
    }

    async fn run(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let JobParameters::Align {
            action,
            experiments,
            auto_align,
            auto_fix,
        } = parameters
        else {
            return Err(unexpected(self.phase(), parameters));
        };

        let project = key.project();
        let experiments = experiments
            .iter()
            .map(|expt_id| project.experiment(expt_id.clone()))
            .collect();
        let guard = AlignmentGuard::new(
            Arc::clone(&self.context.rpc),
            Arc::clone(&self.context.archive),
        );
        let request = AlignmentRequest::project(
            project,
            *action,
            grid.clone(),
            experiments,
            *auto_align,
            *auto_fix,
        );
        Ok(JobOutput::Alignment(guard.align(&request).await?))
    }
}

/// One federated training cycle.
pub struct TrainingJob {
    context: RunnerContext,
}

impl TrainingJob {
    pub fn new(context: RunnerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobRunner for TrainingJob {
    fn phase(&self) -> Phase {
        Phase::Train
    }

    async fn run(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let JobParameters::Train { action, flags, .. } = parameters else {
            return Err(unexpected(self.phase(), parameters));
        };
        let key = combination(key)?;
        let archive = &self.context.archive;

        let experiment = archive
            .read_experiment(&key.experiment())?
            .ok_or_else(|| validation_error!("no model declared for {}", key.experiment()))?;
        let run = archive
            .read_run(key)?
            .ok_or_else(|| validation_error!("no run declared for {}", key))?;

        let task = TrainingTask {
            key: key.clone(),
            action: *action,
            grid: self.context.aligned_grid(&key.project(), grid)?,
            experiment,
            hyperparameters: run.hyperparameters,
            flags: flags.clone(),
            out_dir: key.result_dir(&self.context.out_dir),
        };
        let model = self.context.trainer.train(&task).await?;
        info!(
            collab_id = %key.collab_id,
            project_id = %key.project_id,
            expt_id = %key.expt_id,
            run_id = %key.run_id,
            local_models = model.local.len(),
            "Training cycle completed"
        );
        Ok(JobOutput::Training(model))
    }
}

/// Validation of a trained model across the grid.
pub struct InferenceJob {
    context: RunnerContext,
}

impl InferenceJob {
    pub fn new(context: RunnerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobRunner for InferenceJob {
    fn phase(&self) -> Phase {
        Phase::Evaluate
    }

    async fn run(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let JobParameters::Evaluate {
            action,
            participants,
            metas,
            flags,
            ..
        } = parameters
        else {
            return Err(unexpected(self.phase(), parameters));
        };
        let key = combination(key)?;
        let grid = self.context.aligned_grid(&key.project(), grid)?;

        let statistics = self
            .context
            .collect_statistics(key, *action, &grid, participants.clone(), metas.clone(), flags)
            .await?;
        Ok(JobOutput::Validation(statistics))
    }
}

/// Prediction on newly declared data tags of one participant.
pub struct PredictionJob {
    context: RunnerContext,
}

impl PredictionJob {
    pub fn new(context: RunnerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobRunner for PredictionJob {
    fn phase(&self) -> Phase {
        Phase::Predict
    }

    async fn run(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let JobParameters::Predict {
            action,
            participant_id,
            tags,
            flags,
            ..
        } = parameters
        else {
            return Err(unexpected(self.phase(), parameters));
        };
        let key = combination(key)?;
        let project = key.project();

        let declared = tags
            .get(&project.project_id)
            .cloned()
            .ok_or_else(|| validation_error!("no predict tags declared for {}", project))?;
        let entry = grid.find_participant(participant_id).ok_or_else(|| {
            validation_error!("participant '{}' is not part of the grid for {}", participant_id, key)
        })?;
        let mut updated_tags = entry.tags.clone();
        updated_tags.set(DatasetMeta::Predict, declared.clone());
        let tagged = grid.with_tags(participant_id, DatasetMeta::Predict, declared);

        // The model shape is fixed once inference is requested
        let guard = AlignmentGuard::new(
            Arc::clone(&self.context.rpc),
            Arc::clone(&self.context.archive),
        );
        let plan = guard
            .align(&AlignmentRequest {
                key: project.clone(),
                action: *action,
                grid: tagged.clone(),
                triggers: [participant_id.clone()].into_iter().collect(),
                declared_metas: vec![DatasetMeta::Predict],
                experiments: Vec::new(),
                auto_align: flags.auto_align,
                auto_fix: false,
            })
            .await?;
        let aligned = tagged.with_alignments(&plan.spacers);

        let statistics = self
            .context
            .collect_statistics(
                key,
                *action,
                &aligned,
                vec![participant_id.clone()],
                vec![DatasetMeta::Predict],
                flags,
            )
            .await?;

        Ok(JobOutput::Prediction {
            participant_id: participant_id.clone(),
            tags: updated_tags,
            alignment: plan,
            statistics,
        })
    }
}

/// Inline runners keyed by phase.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<Phase, Arc<dyn JobRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the alignment, training, validation and prediction
    /// runners.
    pub fn standard(context: RunnerContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AlignmentJob::new(context.clone())));
        registry.register(Arc::new(TrainingJob::new(context.clone())));
        registry.register(Arc::new(InferenceJob::new(context.clone())));
        registry.register(Arc::new(PredictionJob::new(context)));
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn JobRunner>) {
        self.runners.insert(runner.phase(), runner);
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(&phase).cloned()
    }
}
