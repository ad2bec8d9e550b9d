use std::sync::Arc;

use fg_types::{FgError, FgResult, OptimizationError, ResourceBudget};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::coordinator::{TrialContext, TrialExecutor};
use crate::resources::TrialAllocation;
use crate::search::{strategy_from_name, SearchSpace};
use crate::trial::{
    ObjectiveDirection, Trial, TrialResult, TrialStatus, TuningConfig, TuningStatus,
};

/// Drives a search strategy, keeping up to `concurrency` trials in flight.
pub struct Tuner {
    executor: Arc<dyn TrialExecutor>,
    budget: ResourceBudget,
}

impl Tuner {
    pub fn new(executor: Arc<dyn TrialExecutor>, budget: ResourceBudget) -> Self {
        Self { executor, budget }
    }

    /// Run trials until the strategy is exhausted, `max_trials` have been
    /// launched or the time budget runs out. Trials already in flight when
    /// the budget runs out are allowed to finish.
    ///
    /// The configured metric and the per-trial share of the budget replace
    /// those of `context`.
    pub async fn tune(
        &self,
        mut context: TrialContext,
        space: SearchSpace,
        config: TuningConfig,
    ) -> FgResult<TuningStatus> {
        let allocation = TrialAllocation::new(&self.budget, config.concurrency);
        let mut strategy = strategy_from_name(
            &config.strategy,
            space,
            config.exploration_weight,
            config.grid_steps,
        )?;
        context.metric = config.metric.parse()?;
        context.resources = allocation.per_trial;
        let context = Arc::new(context);

        let mut status = TuningStatus::new(config.clone(), allocation.clone());
        status.mark_running();
        info!(
            expt_id = %context.experiment.expt_id,
            strategy = strategy.name(),
            max_trials = config.max_trials,
            concurrency = allocation.concurrency,
            cpus_per_trial = allocation.per_trial.cpus,
            "Hyperparameter search started"
        );

        let deadline = config.max_exec_duration.map(|budget| Instant::now() + budget);
        let mut running: JoinSet<(usize, FgResult<TrialResult>)> = JoinSet::new();
        let mut launched = 0;
        let mut exhausted = false;

        loop {
            while !exhausted && running.len() < allocation.concurrency {
                if launched >= config.max_trials {
                    exhausted = true;
                    break;
                }
                if matches!(deadline, Some(deadline) if Instant::now() >= deadline) {
                    info!(launched, "Search time budget spent, no further trials");
                    exhausted = true;
                    break;
                }
                let Some(assignment) = strategy.suggest(1).pop() else {
                    exhausted = true;
                    break;
                };

                let number = launched;
                launched += 1;
                status.trials.push(Trial::new(number, assignment.clone()));
                let executor = Arc::clone(&self.executor);
                let context = Arc::clone(&context);
                running.spawn(async move {
                    let result = executor.run_trial(&context, &assignment).await;
                    (number, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((number, Ok(result))) => {
                    // Strategies maximise what they are told
                    let signal = match config.direction {
                        ObjectiveDirection::Maximize => result.objective,
                        ObjectiveDirection::Minimize => -result.objective,
                    };
                    strategy.report(&result.parameters, signal);
                    status.update_best(&result);
                    if let Some(trial) = status.trial_mut(number) {
                        trial.mark_completed(result);
                    }
                }
                Ok((number, Err(error))) => {
                    if matches!(
                        error,
                        FgError::Optimization(OptimizationError::StandaloneUnsupported { .. })
                    ) {
                        running.abort_all();
                        status.mark_failed(error.to_string());
                        return Err(error);
                    }
                    warn!(trial = number, error = %error, "Trial failed");
                    if let Some(trial) = status.trial_mut(number) {
                        trial.mark_failed(error.to_string());
                    }
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Trial task ended abnormally");
                }
            }
        }

        for trial in status
            .trials
            .iter_mut()
            .filter(|t| t.status == TrialStatus::Running)
        {
            trial.mark_failed("trial task ended abnormally".to_string());
        }

        if status.count(TrialStatus::Completed) == 0 && !status.trials.is_empty() {
            status.mark_failed("every trial failed".to_string());
        } else {
            status.mark_completed();
        }
        info!(
            completed = status.count(TrialStatus::Completed),
            failed = status.count(TrialStatus::Failed),
            best = ?status.best_trial.as_ref().map(|b| b.objective),
            "Hyperparameter search finished"
        );
        Ok(status)
    }
}
