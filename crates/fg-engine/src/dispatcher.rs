//! Job dispatch.
//!
//! One `Dispatcher` is chosen at startup from the configured mode. The
//! queue-backed dispatcher only publishes; the inline dispatcher only runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fg_archive::Archive;
use fg_types::{
    internal_error, validation_error, CombinationKey, CoordinatorConfig, DatasetMeta,
    DispatchError, DispatchMode, FgError, FgResult, Grid, JobKey, JobMessage, JobParameters,
    Phase, QueueEndpoint, RunRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::archival::archive_output;
use crate::queue::{ProducerFactory, QueueProducer};
use crate::runner::{JobOutput, RunnerRegistry};

/// Lifecycle of one combination inside a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombinationState {
    Enumerated,
    Queued,
    Running,
    Completed,
    Failed,
}

fn log_state(key: &JobKey, phase: Phase, state: CombinationState) {
    match state {
        CombinationState::Failed => error!(key = %key, phase = %phase, state = ?state, "Combination state"),
        _ => info!(key = %key, phase = %phase, state = ?state, "Combination state"),
    }
}

/// Combinations of one phase sharing a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct JobBatch {
    pub phase: Phase,
    pub grid: Grid,
    pub jobs: Vec<(JobKey, JobParameters)>,
}

impl JobBatch {
    pub fn new(phase: Phase, grid: Grid) -> Self {
        Self {
            phase,
            grid,
            jobs: Vec::new(),
        }
    }

    /// Batch from enumerated combinations, in key order.
    pub fn from_combinations(
        phase: Phase,
        grid: Grid,
        combinations: BTreeMap<CombinationKey, JobParameters>,
    ) -> Self {
        let jobs = combinations
            .into_iter()
            .map(|(key, parameters)| (key.into(), parameters))
            .collect();
        Self { phase, grid, jobs }
    }

    pub fn push(&mut self, key: impl Into<JobKey>, parameters: JobParameters) {
        self.jobs.push((key.into(), parameters));
    }

    pub fn with_job(mut self, key: impl Into<JobKey>, parameters: JobParameters) -> Self {
        self.push(key, parameters);
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Reject the batch if any job is malformed. Nothing is dispatched from
    /// a batch that fails here.
    pub fn validate(&self) -> FgResult<()> {
        for (key, parameters) in &self.jobs {
            parameters.validate(self.phase, key)?;
            log_state(key, self.phase, CombinationState::Enumerated);
        }
        Ok(())
    }

    /// One queue message per job. Optimize jobs stay whole so the optimize
    /// consumer runs training and evaluation in order.
    pub fn messages(&self) -> FgResult<Vec<JobMessage>> {
        self.validate()?;
        Ok(self
            .jobs
            .iter()
            .map(|(key, parameters)| {
                JobMessage::new(key.clone(), self.grid.clone(), parameters.clone())
            })
            .collect())
    }
}

/// Split optimize parameters into its training and evaluation parts, in
/// the order a consumer runs them. Other phases are returned as `None`.
pub fn expand_optimize(
    grid: &Grid,
    parameters: &JobParameters,
) -> Option<(JobParameters, JobParameters)> {
    let JobParameters::Optimize {
        action,
        experiment,
        run,
        flags,
        ..
    } = parameters
    else {
        return None;
    };
    let train = JobParameters::Train {
        action: *action,
        experiment: experiment.clone(),
        run: run.clone(),
        flags: flags.clone(),
    };
    let evaluate = JobParameters::Evaluate {
        action: *action,
        experiment: experiment.clone(),
        run: run.clone(),
        participants: grid.participants(),
        metas: vec![DatasetMeta::Evaluate],
        flags: flags.clone(),
    };
    Some((train, evaluate))
}

/// A message handed to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReceipt {
    pub key: JobKey,
    pub phase: Phase,
    pub endpoint: String,
}

/// A job executed in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub key: JobKey,
    pub phase: Phase,
    pub output: JobOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Published; completion happens in a consumer.
    Queued(Vec<QueueReceipt>),
    /// Executed to completion and archived.
    Completed(Vec<CompletedJob>),
}

impl DispatchOutcome {
    pub fn states(&self) -> Vec<(JobKey, Phase, CombinationState)> {
        match self {
            Self::Queued(receipts) => receipts
                .iter()
                .map(|r| (r.key.clone(), r.phase, CombinationState::Queued))
                .collect(),
            Self::Completed(jobs) => jobs
                .iter()
                .map(|j| (j.key.clone(), j.phase, CombinationState::Completed))
                .collect(),
        }
    }

    pub fn completed(&self) -> &[CompletedJob] {
        match self {
            Self::Queued(_) => &[],
            Self::Completed(jobs) => jobs,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    async fn dispatch(&self, batch: JobBatch) -> FgResult<DispatchOutcome>;
}

/// Cluster mode: publish every combination to its phase queue.
pub struct QueueDispatcher {
    config: CoordinatorConfig,
    factory: Arc<dyn ProducerFactory>,
}

impl QueueDispatcher {
    pub fn new(config: CoordinatorConfig, factory: Arc<dyn ProducerFactory>) -> Self {
        Self { config, factory }
    }

    /// Resolve every message's endpoint before anything is published.
    fn route(
        &self,
        messages: Vec<JobMessage>,
    ) -> FgResult<Vec<(Phase, QueueEndpoint, Vec<JobMessage>)>> {
        let mut groups: Vec<(Phase, QueueEndpoint, Vec<JobMessage>)> = Vec::new();
        for message in messages {
            let Some(endpoint) = self.config.queue_for(message.key.collab_id()).cloned() else {
                error!(
                    key = %message.key,
                    phase = %message.phase,
                    "Cluster mode requested without a queue endpoint"
                );
                return Err(DispatchError::QueueNotConfigured { key: message.key }.into());
            };
            match groups
                .iter_mut()
                .find(|(phase, target, _)| *phase == message.phase && *target == endpoint)
            {
                Some((_, _, queued)) => queued.push(message),
                None => groups.push((message.phase, endpoint, vec![message])),
            }
        }
        Ok(groups)
    }
}

async fn publish_all(producer: &mut dyn QueueProducer, messages: &[JobMessage]) -> FgResult<()> {
    for message in messages {
        producer.publish(message).await?;
    }
    Ok(())
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Cluster
    }

    async fn dispatch(&self, batch: JobBatch) -> FgResult<DispatchOutcome> {
        let groups = self.route(batch.messages()?)?;

        let mut receipts = Vec::new();
        for (phase, endpoint, messages) in groups {
            let mut producer = self.factory.producer(phase, &endpoint);
            producer.connect().await?;
            let published = publish_all(producer.as_mut(), &messages).await;
            let closed = producer.disconnect().await;
            if let Err(e) = &closed {
                warn!(queue = %phase, error = %e, "Queue disconnect failed");
            }
            published?;
            closed?;

            for message in messages {
                log_state(&message.key, phase, CombinationState::Queued);
                receipts.push(QueueReceipt {
                    key: message.key,
                    phase,
                    endpoint: endpoint.address(),
                });
            }
        }
        Ok(DispatchOutcome::Queued(receipts))
    }
}

/// Standalone mode: run every combination in-process, one after another.
pub struct InlineDispatcher {
    runners: RunnerRegistry,
    archive: Arc<dyn Archive>,
}

impl InlineDispatcher {
    pub fn new(runners: RunnerRegistry, archive: Arc<dyn Archive>) -> Self {
        Self { runners, archive }
    }

    async fn run_one(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let phase = parameters.phase();
        let runner = self
            .runners
            .get(phase)
            .ok_or_else(|| DispatchError::RunnerMissing {
                key: key.clone(),
                phase,
            })?;

        log_state(key, phase, CombinationState::Running);
        let output = runner
            .run(key, grid, parameters)
            .await
            .and_then(|output| {
                archive_output(self.archive.as_ref(), key, &output)?;
                Ok(output)
            })
            .map_err(|e| {
                log_state(key, phase, CombinationState::Failed);
                keyed(e, key, phase)
            })?;
        log_state(key, phase, CombinationState::Completed);
        Ok(output)
    }

    async fn run_optimize(
        &self,
        key: &JobKey,
        grid: &Grid,
        parameters: &JobParameters,
    ) -> FgResult<JobOutput> {
        let JobParameters::Optimize {
            hyperparameters, ..
        } = parameters
        else {
            return Err(validation_error!("{} is not an optimize job", key));
        };
        let Some((train, evaluate)) = expand_optimize(grid, parameters) else {
            return Err(validation_error!("{} is not an optimize job", key));
        };
        let combination = key
            .combination()
            .ok_or_else(|| validation_error!("{} is not a full combination key", key))?;

        let run = RunRecord::new(combination.clone(), hyperparameters.clone());
        self.archive.write_run(run.clone())?;

        let JobOutput::Training(model) = self.run_one(key, grid, &train).await? else {
            return Err(internal_error!("training runner returned a foreign output for {}", key));
        };
        let JobOutput::Validation(validation) = self.run_one(key, grid, &evaluate).await? else {
            return Err(internal_error!("evaluation runner returned a foreign output for {}", key));
        };
        Ok(JobOutput::Optimization {
            run,
            model,
            validation,
        })
    }
}

/// Attach the combination key to errors that do not already carry one.
fn keyed(error: FgError, key: &JobKey, phase: Phase) -> FgError {
    let message = match error {
        FgError::Validation(message) | FgError::Archive(message) | FgError::Internal(message) => {
            message
        }
        FgError::Io(e) => e.to_string(),
        FgError::Serialization(e) => e.to_string(),
        other => return other,
    };
    DispatchError::JobFailed {
        key: key.clone(),
        phase,
        message,
    }
    .into()
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Standalone
    }

    async fn dispatch(&self, batch: JobBatch) -> FgResult<DispatchOutcome> {
        batch.validate()?;

        let mut completed = Vec::with_capacity(batch.len());
        for (key, parameters) in &batch.jobs {
            let output = match parameters {
                JobParameters::Optimize { .. } => {
                    self.run_optimize(key, &batch.grid, parameters).await?
                }
                _ => self.run_one(key, &batch.grid, parameters).await?,
            };
            completed.push(CompletedJob {
                key: key.clone(),
                phase: parameters.phase(),
                output,
            });
        }
        Ok(DispatchOutcome::Completed(completed))
    }
}

/// Dispatcher for the configured mode.
pub fn build_dispatcher(
    config: &CoordinatorConfig,
    factory: Arc<dyn ProducerFactory>,
    runners: RunnerRegistry,
    archive: Arc<dyn Archive>,
) -> Arc<dyn Dispatcher> {
    match config.mode {
        DispatchMode::Cluster => Arc::new(QueueDispatcher::new(config.clone(), factory)),
        DispatchMode::Standalone => Arc::new(InlineDispatcher::new(runners, archive)),
    }
}
