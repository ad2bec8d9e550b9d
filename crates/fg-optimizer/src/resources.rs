//! Static compute budget shared between concurrent trials.

use fg_types::ResourceBudget;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Compute claimed by one trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialResources {
    /// Fractional CPUs.
    pub cpus: f64,
    pub gpus: f64,
}

/// Split of the configured budget across concurrent trials, so search never
/// claims more than the host the training workloads also run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialAllocation {
    pub concurrency: usize,
    pub per_trial: TrialResources,
}

impl TrialAllocation {
    pub fn new(budget: &ResourceBudget, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            warn!("Trial concurrency of 0 requested, running trials one at a time");
            1
        } else {
            concurrency
        };
        let share = concurrency as f64;
        Self {
            concurrency,
            per_trial: TrialResources {
                cpus: budget.cores.max(0.0) / share,
                gpus: budget.gpus.max(0.0) / share,
            },
        }
    }

    /// Combined claim of every in-flight trial.
    pub fn total(&self) -> TrialResources {
        let share = self.concurrency as f64;
        TrialResources {
            cpus: self.per_trial.cpus * share,
            gpus: self.per_trial.gpus * share,
        }
    }
}
