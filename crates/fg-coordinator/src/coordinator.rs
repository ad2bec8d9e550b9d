//! Request-level operations of a collaboration.
//!
//! A request is enumerated into combinations, dispatched on the configured
//! grid and, when executed in-process, its statistics are logged to every
//! tracking destination.

use std::collections::BTreeMap;
use std::sync::Arc;

use fg_archive::Archive;
use fg_engine::{DispatchOutcome, Dispatcher, JobBatch, JobOutput};
use fg_optimizer::{
    is_search_run, CompletionBarrier, SearchSpace, TrialContext, TrialCoordinator,
    TrialResources, Tuner, TuningConfig, TuningStatus,
};
use fg_tracking::{LogReport, TrackingBridge, TrackingServiceFactory};
use fg_types::{
    config_error, Action, CombinationEnumerator, CombinationKey, CoordinatorConfig, CycleFlags,
    DatasetTag, DispatchMode, EnumerationRequest, ExperimentKey, FgResult, Grid, InferenceKind,
    JobParameters, ParticipantStatistics, Phase, ProjectKey, StatisticsRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// Alignment of a project's experiments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentOrder {
    pub project: ProjectKey,
    pub action: Action,
    pub experiments: Vec<String>,
    #[serde(default = "enabled")]
    pub auto_align: bool,
    #[serde(default = "enabled")]
    pub auto_fix: bool,
}

fn enabled() -> bool {
    true
}

/// Prediction on data tags newly declared by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub action: Action,
    pub collab_id: String,
    pub project_id: String,
    pub participant_id: String,
    pub tags: Vec<DatasetTag>,
    #[serde(default)]
    pub experiments: Vec<String>,
    #[serde(default)]
    pub runs: Vec<String>,
    #[serde(default)]
    pub flags: CycleFlags,
}

/// A hyperparameter search over one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub experiment: ExperimentKey,
    pub action: Action,
    /// `{name: {"_type": ..., "_value": ...}}`
    pub search_space: Value,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub flags: CycleFlags,
}

/// What an inference request produced.
#[derive(Debug)]
pub struct CycleReport {
    pub outcome: DispatchOutcome,
    /// Present only when statistics were produced in-process.
    pub tracking: Option<LogReport>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    archive: Arc<dyn Archive>,
    enumerator: Arc<dyn CombinationEnumerator>,
    grids: Vec<Grid>,
    dispatcher: Arc<dyn Dispatcher>,
    bridge: TrackingBridge,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        archive: Arc<dyn Archive>,
        enumerator: Arc<dyn CombinationEnumerator>,
        grids: Vec<Grid>,
        dispatcher: Arc<dyn Dispatcher>,
        tracking: Arc<dyn TrackingServiceFactory>,
    ) -> Self {
        let bridge = TrackingBridge::new(Arc::clone(&archive), tracking, &config.tracking);
        Self {
            config,
            archive,
            enumerator,
            grids,
            dispatcher,
            bridge,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn grids(&self) -> &[Grid] {
        &self.grids
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    pub fn bridge(&self) -> &TrackingBridge {
        &self.bridge
    }

    /// The grid selected by `grid_index`.
    pub fn grid(&self) -> FgResult<&Grid> {
        self.grids.get(self.config.grid_index).ok_or_else(|| {
            error!(
                grid_index = self.config.grid_index,
                grids = self.grids.len(),
                "Selected grid is not registered"
            );
            config_error!(
                "grid index {} selected but only {} grids are registered",
                self.config.grid_index,
                self.grids.len()
            )
        })
    }

    fn batch(&self, phase: Phase, mut request: EnumerationRequest) -> FgResult<JobBatch> {
        let grid = self.grid()?.clone();
        request.phases = vec![phase];
        let combinations = self.enumerator.enumerate(&request)?;
        if combinations.is_empty() {
            warn!(
                collab_id = %request.collab_id,
                project_id = %request.project_id,
                phase = %phase,
                "Request enumerated no combinations"
            );
        }
        Ok(JobBatch::from_combinations(phase, grid, combinations))
    }

    /// Align the project's experiments against every participant's data.
    pub async fn align(&self, order: AlignmentOrder) -> FgResult<DispatchOutcome> {
        let batch = JobBatch::new(Phase::Align, self.grid()?.clone()).with_job(
            order.project.clone(),
            JobParameters::Align {
                action: order.action,
                experiments: order.experiments,
                auto_align: order.auto_align,
                auto_fix: order.auto_fix,
            },
        );
        let outcome = self.dispatcher.dispatch(batch).await?;
        info!(
            collab_id = %order.project.collab_id,
            project_id = %order.project.project_id,
            mode = ?self.mode(),
            "Alignment dispatched"
        );
        Ok(outcome)
    }

    pub async fn train(&self, request: EnumerationRequest) -> FgResult<DispatchOutcome> {
        let batch = self.batch(Phase::Train, request)?;
        let jobs = batch.len();
        let outcome = self.dispatcher.dispatch(batch).await?;
        info!(jobs, mode = ?self.mode(), "Training dispatched");
        Ok(outcome)
    }

    /// Evaluate trained models. Without named participants the whole grid
    /// is evaluated.
    pub async fn validate(&self, mut request: EnumerationRequest) -> FgResult<CycleReport> {
        if request.participants.is_empty() {
            request.participants = self.grid()?.participants();
        }
        let batch = self.batch(Phase::Evaluate, request)?;
        let outcome = self.dispatcher.dispatch(batch).await?;
        let tracking = self.track(&outcome).await;
        Ok(CycleReport { outcome, tracking })
    }

    /// Predict with every trained model on the participant's new tags.
    pub async fn predict(&self, request: PredictionRequest) -> FgResult<CycleReport> {
        // Predictions cover the combinations a training cycle would
        let trained = self.batch(
            Phase::Train,
            EnumerationRequest {
                action: request.action,
                collab_id: request.collab_id.clone(),
                project_id: request.project_id.clone(),
                experiments: request.experiments.clone(),
                runs: request.runs.clone(),
                participants: vec![request.participant_id.clone()],
                phases: Vec::new(),
                flags: request.flags.clone(),
            },
        )?;

        let tags: BTreeMap<String, Vec<DatasetTag>> =
            [(request.project_id.clone(), request.tags.clone())].into_iter().collect();
        let mut batch = JobBatch::new(Phase::Predict, trained.grid);
        for (key, _) in trained.jobs {
            let Some(combination) = key.combination() else {
                continue;
            };
            let parameters = JobParameters::Predict {
                action: request.action,
                experiment: combination.expt_id.clone(),
                run: combination.run_id.clone(),
                participant_id: request.participant_id.clone(),
                tags: tags.clone(),
                flags: request.flags.clone(),
            };
            batch.push(key, parameters);
        }

        let outcome = self.dispatcher.dispatch(batch).await?;
        let tracking = self.track(&outcome).await;
        Ok(CycleReport { outcome, tracking })
    }

    /// Run a hyperparameter search on the selected grid. Cluster mode only.
    pub async fn optimize(&self, request: SearchRequest) -> FgResult<TuningStatus> {
        let space = SearchSpace::from_tune_spec(&request.search_space)?;
        let context = TrialContext {
            experiment: request.experiment,
            action: request.action,
            grid: self.grid()?.clone(),
            metric: request.tuning.metric.parse()?,
            flags: request.flags,
            resources: TrialResources { cpus: 0.0, gpus: 0.0 },
        };
        let barrier = CompletionBarrier::new(Arc::clone(&self.archive), &self.config.optimization);
        let executor = TrialCoordinator::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.archive),
            barrier,
        );
        Tuner::new(Arc::new(executor), self.config.resources.clone())
            .tune(context, space, request.tuning)
            .await
    }

    /// Validation statistics of every search-generated run of `experiment`.
    pub fn optimization_results(&self, experiment: &ExperimentKey) -> FgResult<Vec<StatisticsRecord>> {
        Ok(self
            .archive
            .read_experiment_statistics(InferenceKind::Validation, experiment)?
            .into_iter()
            .filter(|record| is_search_run(&record.key.combination.run_id))
            .collect())
    }

    /// Log statistics of in-process jobs to the tracking destinations.
    async fn track(&self, outcome: &DispatchOutcome) -> Option<LogReport> {
        let accumulations = accumulate(outcome);
        if accumulations.is_empty() {
            return None;
        }
        let report = self.bridge.log(&accumulations, &self.config.out_dir).await;
        if !report.is_complete() {
            warn!(
                failures = report.failures.len(),
                runs = report.runs.len(),
                "Tracking incomplete"
            );
        }
        Some(report)
    }
}

/// Inference statistics per combination, merged across jobs.
fn accumulate(outcome: &DispatchOutcome) -> BTreeMap<CombinationKey, ParticipantStatistics> {
    let mut accumulations: BTreeMap<CombinationKey, ParticipantStatistics> = BTreeMap::new();
    for job in outcome.completed() {
        let statistics = match &job.output {
            JobOutput::Validation(statistics) => statistics,
            JobOutput::Prediction { statistics, .. } => statistics,
            JobOutput::Optimization { validation, .. } => validation,
            JobOutput::Alignment(_) | JobOutput::Training(_) => continue,
        };
        let Some(key) = job.key.combination() else {
            continue;
        };
        accumulations
            .entry(key.clone())
            .or_default()
            .extend(statistics.clone());
    }
    accumulations
}
