use std::collections::BTreeMap;
use std::sync::Arc;

use fg_rpc::{InferenceRequest, WorkerRpc};
use fg_types::{
    internal_error, Action, CombinationKey, DatasetMeta, FgError, FgResult, Grid, GridEntry,
    InferenceRefs, MetaStatistics, ParticipantStatistics, RpcError, SpacerIndices,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Scatter/gather poller for per-participant inference statistics.
pub struct Analyser {
    rpc: Arc<dyn WorkerRpc>,
    metas: Vec<DatasetMeta>,
    auto_align: bool,
}

impl Analyser {
    pub fn new(rpc: Arc<dyn WorkerRpc>, metas: Vec<DatasetMeta>, auto_align: bool) -> Self {
        Self {
            rpc,
            metas,
            auto_align,
        }
    }

    pub fn metas(&self) -> &[DatasetMeta] {
        &self.metas
    }

    /// Query every referenced worker concurrently and wait for all of them.
    ///
    /// `inferences` is keyed by worker id. The result holds exactly one entry
    /// per referenced participant; any failed call fails the whole poll.
    pub async fn poll(
        &self,
        key: &CombinationKey,
        action: Action,
        grid: &Grid,
        inferences: &BTreeMap<String, InferenceRefs>,
    ) -> FgResult<ParticipantStatistics> {
        let pairs = self.pair_with_grid(key, grid, inferences)?;
        debug!(
            expt_id = %key.expt_id,
            run_id = %key.run_id,
            pairs = pairs.len(),
            "Mapped inference references to grid"
        );

        let mut statistics = ParticipantStatistics::new();
        let mut tasks = JoinSet::new();
        for (entry, refs) in pairs {
            if refs.is_empty() {
                statistics.insert(entry.participant_id.clone(), self.empty_statistics());
                continue;
            }

            let rpc = Arc::clone(&self.rpc);
            let key = key.clone();
            let metas = self.metas.clone();
            let request = InferenceRequest {
                action,
                tags: entry.tags.clone(),
                alignments: self.alignments_for(&entry),
                inferences: refs,
            };
            tasks.spawn(async move {
                let participant_id = entry.participant_id.clone();
                let polled = poll_participant(rpc, key, entry, request, metas).await;
                (participant_id, polled)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (participant_id, polled) =
                joined.map_err(|e| internal_error!("statistics task failed: {}", e))?;
            match polled {
                Ok(stats) => {
                    statistics.insert(participant_id, stats);
                }
                Err(e) => {
                    error!(
                        participant_id = %participant_id,
                        expt_id = %key.expt_id,
                        run_id = %key.run_id,
                        error = %e,
                        "Statistics poll failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            collab_id = %key.collab_id,
            project_id = %key.project_id,
            expt_id = %key.expt_id,
            run_id = %key.run_id,
            participants = statistics.len(),
            "Collected participant statistics"
        );
        Ok(statistics)
    }

    /// Match references to grid entries by worker id. Never positional.
    fn pair_with_grid(
        &self,
        key: &CombinationKey,
        grid: &Grid,
        inferences: &BTreeMap<String, InferenceRefs>,
    ) -> FgResult<Vec<(GridEntry, InferenceRefs)>> {
        inferences
            .iter()
            .map(|(worker_id, refs)| {
                grid.find_worker(worker_id)
                    .map(|entry| (entry.clone(), refs.clone()))
                    .ok_or_else(|| {
                        FgError::from(RpcError::UnknownWorker {
                            key: key.clone(),
                            worker_id: worker_id.clone(),
                        })
                    })
            })
            .collect()
    }

    fn alignments_for(&self, entry: &GridEntry) -> SpacerIndices {
        if self.auto_align {
            entry.alignment.clone().unwrap_or_default()
        } else {
            SpacerIndices::default()
        }
    }

    fn empty_statistics(&self) -> MetaStatistics {
        self.metas
            .iter()
            .map(|meta| (*meta, Default::default()))
            .collect()
    }
}

async fn poll_participant(
    rpc: Arc<dyn WorkerRpc>,
    key: CombinationKey,
    entry: GridEntry,
    request: InferenceRequest,
    metas: Vec<DatasetMeta>,
) -> FgResult<MetaStatistics> {
    let response = rpc.infer(&key, &entry, &request).await?;
    let stats = response
        .extract(&key.expt_id, &key.run_id, &metas)
        .ok_or_else(|| RpcError::MalformedResponse {
            key: key.clone().into(),
            participant_id: entry.participant_id.clone(),
            message: format!(
                "no results for experiment '{}' run '{}'",
                key.expt_id, key.run_id
            ),
        })?;
    debug!(
        participant_id = %entry.participant_id,
        metas = stats.len(),
        "Polled statistics tracked"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fg_rpc::{HeadersRequest, InferenceResponse};
    use fg_types::{
        DatasetHeaders, InferenceStatistics, MetaTags, NodeAddress, ParticipantRole,
        ProjectKey, StatValue,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    /// Worker double answering per participant, optionally slowly or with
    /// an error.
    #[derive(Default)]
    struct FakeWorkers {
        delays_ms: BTreeMap<String, u64>,
        failing: Vec<String>,
        requests: Mutex<Vec<(String, InferenceRequest)>>,
    }

    #[async_trait]
    impl WorkerRpc for FakeWorkers {
        async fn poll_headers(
            &self,
            _key: &ProjectKey,
            _entry: &GridEntry,
            _request: &HeadersRequest,
        ) -> FgResult<DatasetHeaders> {
            Ok(DatasetHeaders::default())
        }

        async fn infer(
            &self,
            key: &CombinationKey,
            entry: &GridEntry,
            request: &InferenceRequest,
        ) -> FgResult<InferenceResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((entry.participant_id.clone(), request.clone()));
            if let Some(delay) = self.delays_ms.get(&entry.participant_id) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
            if self.failing.contains(&entry.participant_id) {
                return Err(RpcError::Request {
                    key: key.clone().into(),
                    participant_id: entry.participant_id.clone(),
                    message: "connection refused".into(),
                }
                .into());
            }

            let mut per_meta = BTreeMap::new();
            for meta in request.inferences.keys() {
                let mut statistics = BTreeMap::new();
                statistics.insert("accuracy".to_string(), StatValue::Series(vec![0.5, 0.5]));
                per_meta.insert(
                    meta.as_str().to_string(),
                    InferenceStatistics {
                        statistics,
                        res_path: Some(format!("/out/{}/{}.json", entry.participant_id, meta)),
                    },
                );
            }
            let mut results = BTreeMap::new();
            results.insert(
                fg_rpc::combination_result_key(&key.expt_id, &key.run_id),
                per_meta,
            );
            Ok(InferenceResponse { results })
        }
    }

    fn entry(participant: &str) -> GridEntry {
        GridEntry {
            participant_id: participant.into(),
            worker_id: format!("syft-{}", participant),
            address: NodeAddress {
                host: "127.0.0.1".into(),
                port: 8020,
                f_port: 5000,
            },
            role: ParticipantRole::Guest,
            tags: MetaTags::default(),
            alignment: None,
        }
    }

    fn key() -> CombinationKey {
        CombinationKey::new("c", "p", "e", "r")
    }

    fn refs(metas: &[DatasetMeta]) -> InferenceRefs {
        metas
            .iter()
            .map(|meta| (*meta, vec![format!("ptr-{}", meta)]))
            .collect()
    }

    #[tokio::test]
    async fn pairs_by_worker_id_not_position() {
        let workers = Arc::new(FakeWorkers::default());
        let analyser = Analyser::new(workers.clone(), vec![DatasetMeta::Evaluate], true);

        // Grid order and reference order disagree, and carol has no refs
        let grid = Grid::new(vec![entry("carol"), entry("bob"), entry("alice")]);
        let mut inferences = BTreeMap::new();
        inferences.insert("syft-alice".to_string(), refs(&[DatasetMeta::Evaluate]));
        inferences.insert("syft-bob".to_string(), refs(&[DatasetMeta::Evaluate]));

        let stats = analyser
            .poll(&key(), Action::Classify, &grid, &inferences)
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats["alice"][&DatasetMeta::Evaluate].res_path.as_deref(),
            Some("/out/alice/evaluate.json")
        );

        let requests = workers.requests.lock().unwrap();
        let (participant, request) = requests
            .iter()
            .find(|(participant, _)| participant == "bob")
            .unwrap();
        assert_eq!(participant, "bob");
        assert_eq!(request.inferences[&DatasetMeta::Evaluate], vec!["ptr-evaluate"]);
    }

    #[tokio::test]
    async fn empty_references_short_circuit() {
        let workers = Arc::new(FakeWorkers::default());
        let analyser = Analyser::new(
            workers.clone(),
            vec![DatasetMeta::Train, DatasetMeta::Evaluate],
            true,
        );
        let grid = Grid::new(vec![entry("alice")]);
        let mut inferences = BTreeMap::new();
        inferences.insert("syft-alice".to_string(), InferenceRefs::new());

        let stats = analyser
            .poll(&key(), Action::Classify, &grid, &inferences)
            .await
            .unwrap();
        assert_eq!(stats["alice"].len(), 2);
        assert!(stats["alice"].values().all(InferenceStatistics::is_empty));
        assert!(workers.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrequested_metas_are_filtered() {
        let workers = Arc::new(FakeWorkers::default());
        let analyser = Analyser::new(workers, vec![DatasetMeta::Predict], true);
        let grid = Grid::new(vec![entry("alice")]);
        let mut inferences = BTreeMap::new();
        inferences.insert(
            "syft-alice".to_string(),
            refs(&[DatasetMeta::Train, DatasetMeta::Predict]),
        );

        let stats = analyser
            .poll(&key(), Action::Classify, &grid, &inferences)
            .await
            .unwrap();
        let metas: Vec<DatasetMeta> = stats["alice"].keys().copied().collect();
        assert_eq!(metas, vec![DatasetMeta::Predict]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_fails_the_poll_after_all_complete() {
        let mut fake = FakeWorkers::default();
        fake.failing.push("bob".into());
        fake.delays_ms.insert("alice".into(), 500);
        let workers = Arc::new(fake);
        let analyser = Analyser::new(workers.clone(), vec![DatasetMeta::Evaluate], true);

        let grid = Grid::new(vec![entry("alice"), entry("bob")]);
        let mut inferences = BTreeMap::new();
        inferences.insert("syft-alice".to_string(), refs(&[DatasetMeta::Evaluate]));
        inferences.insert("syft-bob".to_string(), refs(&[DatasetMeta::Evaluate]));

        let error = analyser
            .poll(&key(), Action::Classify, &grid, &inferences)
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        assert!(error.to_string().contains("bob"));
        assert_eq!(workers.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_worker_is_rejected() {
        let analyser = Analyser::new(
            Arc::new(FakeWorkers::default()),
            vec![DatasetMeta::Evaluate],
            true,
        );
        let grid = Grid::new(vec![entry("alice")]);
        let mut inferences = BTreeMap::new();
        inferences.insert("syft-mallory".to_string(), refs(&[DatasetMeta::Evaluate]));

        let error = analyser
            .poll(&key(), Action::Classify, &grid, &inferences)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            FgError::Rpc(RpcError::UnknownWorker { ref worker_id, .. }) if worker_id == "syft-mallory"
        ));
    }
}
