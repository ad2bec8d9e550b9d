use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fg_archive::Archive;
use fg_types::{
    CombinationKey, FgError, FgResult, InferenceKind, OptimizationError, OptimizationSettings,
    StatisticsRecord,
};
use tokio::time::{sleep, timeout};
use tracing::{debug, error};

/// Blocks a trial until every participant's validation statistics for its
/// combination are archived.
///
/// Archive writes wake the waiter; a fixed-interval re-check runs as well so
/// a missed notification never stalls the trial. The wait is bounded by the
/// configured trial timeout.
#[derive(Clone)]
pub struct CompletionBarrier {
    archive: Arc<dyn Archive>,
    poll_interval: Duration,
    timeout: Duration,
}

impl CompletionBarrier {
    pub fn new(archive: Arc<dyn Archive>, settings: &OptimizationSettings) -> Self {
        Self {
            archive,
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            timeout: Duration::from_secs(settings.trial_timeout_secs),
        }
    }

    /// Participants whose statistics have landed, and those still pending.
    fn collect(
        &self,
        key: &CombinationKey,
        participants: &[String],
    ) -> FgResult<(BTreeMap<String, StatisticsRecord>, Vec<String>)> {
        let mut landed = BTreeMap::new();
        let mut pending = Vec::new();
        for participant_id in participants {
            match self
                .archive
                .read_statistics(InferenceKind::Validation, &key.worker(participant_id.as_str()))?
            {
                Some(record) => {
                    landed.insert(participant_id.clone(), record);
                }
                None => pending.push(participant_id.clone()),
            }
        }
        Ok((landed, pending))
    }

    pub async fn wait(
        &self,
        key: &CombinationKey,
        participants: &[String],
    ) -> FgResult<BTreeMap<String, StatisticsRecord>> {
        // Subscribe before the first check so no write slips between them
        let mut revisions = self.archive.subscribe();

        let waited = timeout(self.timeout, async {
            loop {
                let (landed, pending) = self.collect(key, participants)?;
                if pending.is_empty() {
                    return Ok::<_, FgError>(landed);
                }
                debug!(run_id = %key.run_id, pending = ?pending, "Waiting for trial statistics");
                tokio::select! {
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            sleep(self.poll_interval).await;
                        }
                    }
                    _ = sleep(self.poll_interval) => {}
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                let (_, pending) = self.collect(key, participants)?;
                error!(
                    collab_id = %key.collab_id,
                    project_id = %key.project_id,
                    run_id = %key.run_id,
                    pending = ?pending,
                    "Trial timed out waiting for validation statistics"
                );
                Err(OptimizationError::TrialTimeout {
                    key: key.clone(),
                    pending,
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_archive::MemoryArchive;
    use fg_types::MetaStatistics;

    fn key() -> CombinationKey {
        CombinationKey::new("collab", "project", "expt", "optim_run_1")
    }

    fn participants() -> Vec<String> {
        vec!["alice".to_string(), "bob".to_string()]
    }

    fn settings() -> OptimizationSettings {
        OptimizationSettings {
            poll_interval_ms: 500,
            trial_timeout_secs: 60,
        }
    }

    fn land(archive: &MemoryArchive, participant: &str) {
        archive
            .write_statistics(StatisticsRecord::new(
                key().worker(participant),
                InferenceKind::Validation,
                MetaStatistics::new(),
            ))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn releases_once_every_participant_lands() {
        let archive = Arc::new(MemoryArchive::new());
        let barrier = CompletionBarrier::new(archive.clone(), &settings());

        let writer = {
            let archive = archive.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(3)).await;
                land(&archive, "alice");
                sleep(Duration::from_secs(3)).await;
                land(&archive, "bob");
            })
        };

        let records = barrier.wait(&key(), &participants()).await.unwrap();
        assert_eq!(records.keys().cloned().collect::<Vec<_>>(), participants());
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn prediction_statistics_do_not_count() {
        let archive = Arc::new(MemoryArchive::new());
        archive
            .write_statistics(StatisticsRecord::new(
                key().worker("alice"),
                InferenceKind::Prediction,
                MetaStatistics::new(),
            ))
            .unwrap();
        land(&archive, "bob");

        let barrier = CompletionBarrier::new(archive.clone(), &settings());
        let error = barrier.wait(&key(), &participants()).await.unwrap_err();
        match error {
            FgError::Optimization(OptimizationError::TrialTimeout { key: timed_out, pending }) => {
                assert_eq!(timed_out, key());
                assert_eq!(pending, vec!["alice".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_archived_statistics_release_immediately() {
        let archive = Arc::new(MemoryArchive::new());
        land(&archive, "alice");
        land(&archive, "bob");

        let barrier = CompletionBarrier::new(archive, &settings());
        let started = tokio::time::Instant::now();
        barrier.wait(&key(), &participants()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
