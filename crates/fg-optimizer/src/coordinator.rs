use std::sync::Arc;

use async_trait::async_trait;
use fg_archive::Archive;
use fg_engine::{Dispatcher, JobBatch};
use fg_types::{
    validation_error, Action, CycleFlags, DispatchMode, ExperimentKey, FgResult, Grid,
    JobParameters, OptimizationError, Phase, RunRecord,
};
use tokio::time::Instant;
use tracing::{error, info};

use crate::barrier::CompletionBarrier;
use crate::metrics::{aggregate_metric, summarise, SearchMetric};
use crate::resources::TrialResources;
use crate::search::{to_hyperparameters, Assignment};
use crate::trial::{new_search_run_id, TrialResult};

/// Everything a trial needs besides its hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialContext {
    pub experiment: ExperimentKey,
    pub action: Action,
    pub grid: Grid,
    pub metric: SearchMetric,
    pub flags: CycleFlags,
    pub resources: TrialResources,
}

/// Runs one assignment and reports its objective.
#[async_trait]
pub trait TrialExecutor: Send + Sync {
    async fn run_trial(&self, context: &TrialContext, assignment: &Assignment)
        -> FgResult<TrialResult>;
}

/// Executes trials as federated cycles on the cluster queues.
pub struct TrialCoordinator {
    dispatcher: Arc<dyn Dispatcher>,
    archive: Arc<dyn Archive>,
    barrier: CompletionBarrier,
}

impl TrialCoordinator {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        archive: Arc<dyn Archive>,
        barrier: CompletionBarrier,
    ) -> Self {
        Self {
            dispatcher,
            archive,
            barrier,
        }
    }
}

#[async_trait]
impl TrialExecutor for TrialCoordinator {
    async fn run_trial(
        &self,
        context: &TrialContext,
        assignment: &Assignment,
    ) -> FgResult<TrialResult> {
        // Only one grid session exists in-process, trials need the queues
        if self.dispatcher.mode() != DispatchMode::Cluster {
            error!(
                collab_id = %context.experiment.collab_id,
                project_id = %context.experiment.project_id,
                expt_id = %context.experiment.expt_id,
                "Hyperparameter search requested outside cluster mode"
            );
            return Err(OptimizationError::StandaloneUnsupported {
                key: context.experiment.clone(),
            }
            .into());
        }
        if context.grid.is_empty() {
            return Err(validation_error!(
                "no participants to run trials on for {}",
                context.experiment
            ));
        }

        let started = Instant::now();
        let run_id = new_search_run_id();
        let key = context.experiment.run(run_id.as_str());
        let hyperparameters = to_hyperparameters(assignment);

        // Consumers train from the run record, so it lands before dispatch
        self.archive
            .write_run(RunRecord::new(key.clone(), hyperparameters.clone()))?;

        let batch = JobBatch::new(Phase::Optimize, context.grid.clone()).with_job(
            key.clone(),
            JobParameters::Optimize {
                action: context.action,
                experiment: key.expt_id.clone(),
                run: run_id.clone(),
                hyperparameters,
                flags: context.flags.clone(),
            },
        );
        self.dispatcher.dispatch(batch).await?;
        info!(
            expt_id = %key.expt_id,
            run_id = %run_id,
            participants = context.grid.len(),
            "Trial dispatched"
        );

        let records = self.barrier.wait(&key, &context.grid.participants()).await?;
        let objective = aggregate_metric(context.metric, &records)?;
        info!(run_id = %run_id, metric = %context.metric, objective, "Trial completed");

        Ok(TrialResult {
            run_id,
            objective,
            metrics: summarise(&records),
            parameters: assignment.clone(),
            resources: context.resources,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;
    use crossbeam_channel::{unbounded, Receiver};
    use fg_archive::MemoryArchive;
    use fg_engine::{ChannelProducerFactory, DispatchOutcome, QueueDispatcher, QueuedJob};
    use fg_types::{
        CoordinatorConfig, DatasetMeta, FgError, GridEntry, InferenceKind, InferenceStatistics,
        MetaStatistics, MetaTags, NodeAddress, OptimizationSettings, ParticipantRole,
        QueueEndpoint, StatValue, StatisticsRecord,
    };
    use serde_json::json;
    use std::time::Duration;

    fn grid() -> Grid {
        let entry = |participant: &str| GridEntry {
            participant_id: participant.into(),
            worker_id: format!("worker-{}", participant),
            address: NodeAddress {
                host: "127.0.0.1".into(),
                port: 8020,
                f_port: 5000,
            },
            role: ParticipantRole::Guest,
            tags: MetaTags::default(),
            alignment: None,
        };
        Grid::new(vec![entry("alice"), entry("bob")])
    }

    fn context() -> TrialContext {
        TrialContext {
            experiment: ExperimentKey::new("collab", "project", "expt"),
            action: Action::Classify,
            grid: grid(),
            metric: SearchMetric::Accuracy,
            flags: CycleFlags::default(),
            resources: TrialResources { cpus: 1.0, gpus: 0.0 },
        }
    }

    fn assignment() -> Assignment {
        let mut assignment = Assignment::new();
        assignment.insert("lr".into(), ParameterValue::Float(0.01));
        assignment.insert("rounds".into(), ParameterValue::Int(5));
        assignment
    }

    fn barrier(archive: Arc<MemoryArchive>, timeout_secs: u64) -> CompletionBarrier {
        CompletionBarrier::new(
            archive,
            &OptimizationSettings {
                poll_interval_ms: 200,
                trial_timeout_secs: timeout_secs,
            },
        )
    }

    fn cluster(sender: crossbeam_channel::Sender<QueuedJob>) -> Arc<dyn Dispatcher> {
        let config = CoordinatorConfig {
            mode: DispatchMode::Cluster,
            queue: Some(QueueEndpoint {
                host: "queue.local".into(),
                port: 9092,
            }),
            ..Default::default()
        };
        Arc::new(QueueDispatcher::new(
            config,
            Arc::new(ChannelProducerFactory::new(sender)),
        ))
    }

    /// Stands in for the queue consumer: archives validation statistics for
    /// each evaluation message it picks up.
    fn consume(receiver: Receiver<QueuedJob>, archive: Arc<MemoryArchive>) {
        tokio::spawn(async move {
            loop {
                while let Ok(job) = receiver.try_recv() {
                    // An optimize consumer trains, then evaluates on every participant
                    let JobParameters::Optimize { .. } = job.message.parameters else {
                        continue;
                    };
                    let participants = job.message.grid.participants();
                    let Some(key) = job.message.key.combination().cloned() else {
                        continue;
                    };
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    for participant in participants {
                        let accuracy = match participant.as_str() {
                            "alice" => vec![0.8, 0.6],
                            _ => vec![f64::NAN, 0.5],
                        };
                        let mut evaluate = InferenceStatistics::default();
                        evaluate
                            .statistics
                            .insert("accuracy".into(), StatValue::Series(accuracy));
                        let mut per_meta = MetaStatistics::new();
                        per_meta.insert(DatasetMeta::Evaluate, evaluate);
                        archive
                            .write_statistics(StatisticsRecord::new(
                                key.worker(participant),
                                InferenceKind::Validation,
                                per_meta,
                            ))
                            .unwrap();
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn trial_reports_clamped_cross_participant_mean() {
        let archive = Arc::new(MemoryArchive::new());
        let (sender, receiver) = unbounded();
        consume(receiver, archive.clone());

        let coordinator = TrialCoordinator::new(cluster(sender), archive.clone(), barrier(archive.clone(), 60));
        let result = coordinator.run_trial(&context(), &assignment()).await.unwrap();

        // alice (0.8 + 0.6) / 2, bob (0 + 0.5) / 2
        assert!((result.objective - 0.475).abs() < 1e-9, "got {}", result.objective);
        assert!(result.run_id.starts_with("optim_run_"));
        assert_eq!(result.metrics.len(), 1);

        let run = archive
            .read_run(&context().experiment.run(result.run_id.as_str()))
            .unwrap()
            .unwrap();
        assert_eq!(run.hyperparameters["lr"], json!(0.01));
        assert_eq!(run.hyperparameters["rounds"], json!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_trial_times_out_with_pending_participants() {
        let archive = Arc::new(MemoryArchive::new());
        let (sender, _receiver) = unbounded();

        let coordinator = TrialCoordinator::new(cluster(sender), archive.clone(), barrier(archive, 30));
        let error = coordinator.run_trial(&context(), &assignment()).await.unwrap_err();
        match error {
            FgError::Optimization(OptimizationError::TrialTimeout { key, pending }) => {
                assert!(key.run_id.starts_with("optim_run_"));
                assert_eq!(pending, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct Inline;

    #[async_trait]
    impl Dispatcher for Inline {
        fn mode(&self) -> DispatchMode {
            DispatchMode::Standalone
        }

        async fn dispatch(&self, _batch: JobBatch) -> FgResult<DispatchOutcome> {
            Ok(DispatchOutcome::Completed(Vec::new()))
        }
    }

    #[tokio::test]
    async fn standalone_mode_is_unsupported() {
        let archive = Arc::new(MemoryArchive::new());
        let coordinator = TrialCoordinator::new(Arc::new(Inline), archive.clone(), barrier(archive.clone(), 1));

        let error = coordinator.run_trial(&context(), &assignment()).await.unwrap_err();
        assert!(matches!(
            error,
            FgError::Optimization(OptimizationError::StandaloneUnsupported { .. })
        ));
        assert_eq!(archive.stats().writes, 0);
    }
}
