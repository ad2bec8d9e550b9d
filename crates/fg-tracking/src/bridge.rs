use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use fg_archive::Archive;
use fg_types::{
    CombinationKey, ExperimentKey, FgError, FgResult, MappingKey, ModelArtifacts,
    ParticipantStatistics, StatValue, TrackingDestination, TrackingError, TrackingMapping,
    TrackingSettings,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::naming::{
    experiment_mapping_key, experiment_name, run_mapping_key, run_name, NAME_SEPARATOR,
};
use crate::service::{TrackingService, TrackingServiceFactory};

/// A destination that could not be logged to.
#[derive(Debug)]
pub struct DestinationFailure {
    pub uri: String,
    pub error: FgError,
}

/// Outcome of logging to every configured destination.
#[derive(Debug, Default)]
pub struct LogReport {
    /// Distinct tracking run ids touched, in logging order.
    pub runs: Vec<String>,
    pub failures: Vec<DestinationFailure>,
}

impl LogReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Mirrors the collaboration hierarchy into tracking services.
pub struct TrackingBridge {
    archive: Arc<dyn Archive>,
    factory: Arc<dyn TrackingServiceFactory>,
    destinations: Vec<(TrackingDestination, String)>,
    /// Serialises get-or-create per mapping so concurrent callers share
    /// one tracking entity.
    creating: DashMap<MappingKey, Arc<Mutex<()>>>,
}

impl TrackingBridge {
    pub fn new(
        archive: Arc<dyn Archive>,
        factory: Arc<dyn TrackingServiceFactory>,
        settings: &TrackingSettings,
    ) -> Self {
        let mut destinations = vec![(TrackingDestination::Local, settings.local_uri.clone())];
        if let Some(remote) = &settings.remote_uri {
            destinations.push((TrackingDestination::Remote, remote.clone()));
        }
        Self {
            archive,
            factory,
            destinations,
            creating: DashMap::new(),
        }
    }

    pub fn destinations(&self) -> &[(TrackingDestination, String)] {
        &self.destinations
    }

    /// Get or create the tracking experiment of `key`. A known experiment
    /// reached through a new URI only has its URI updated.
    pub async fn ensure_experiment(
        &self,
        key: &ExperimentKey,
        destination: TrackingDestination,
        uri: &str,
    ) -> FgResult<TrackingMapping> {
        let mapping_key = experiment_mapping_key(key, destination);
        let lock = self.creation_lock(&mapping_key);
        let _guard = lock.lock().await;
        if let Some(existing) = self.archive.read_mapping(&mapping_key)? {
            return self.refresh_uri(existing, &mapping_key, uri);
        }

        let name = experiment_name(key);
        let tracking_id = self.factory.service(uri)?.create_experiment(&name).await?;
        info!(
            collab_id = %key.collab_id,
            project_id = %key.project_id,
            expt_id = %key.expt_id,
            tracking_id = %tracking_id,
            uri,
            "Tracking experiment created"
        );
        self.record_mapping(TrackingMapping::new(mapping_key, tracking_id, name, uri))
    }

    /// Get or create the tracking run of `key`. Its experiment must already
    /// be mapped.
    pub async fn ensure_run(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
        uri: &str,
    ) -> FgResult<TrackingMapping> {
        let experiment = self.experiment_mapping(key, destination)?;
        let mapping_key = run_mapping_key(key, destination);
        let lock = self.creation_lock(&mapping_key);
        let _guard = lock.lock().await;
        if let Some(existing) = self.archive.read_mapping(&mapping_key)? {
            return self.refresh_uri(existing, &mapping_key, uri);
        }

        let params = self
            .archive
            .read_run(key)?
            .map(|run| run.hyperparameters)
            .unwrap_or_default();
        let tracking_id = self
            .factory
            .service(uri)?
            .create_run(&experiment.tracking_id, &run_name(key), &params)
            .await?;
        debug!(
            expt_id = %key.expt_id,
            run_id = %key.run_id,
            tracking_id = %tracking_id,
            "Tracking run created"
        );
        self.record_mapping(TrackingMapping::new(
            mapping_key,
            tracking_id,
            [key.expt_id.as_str(), &key.run_id].join(NAME_SEPARATOR),
            uri,
        ))
    }

    /// Replay archived global and local loss histories. Returns the number
    /// of metric points logged.
    pub async fn log_losses(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
    ) -> FgResult<usize> {
        let (service, run) = self.run_session(key, destination)?;
        let Some(model) = self.archive.read_model(key)? else {
            debug!(run_id = %key.run_id, "No model archived, no losses to log");
            return Ok(0);
        };

        let mut logged = 0;
        if let Some(global) = read_history::<BTreeMap<String, BTreeMap<String, f64>>>(&model.global).await? {
            for (meta, losses) in global {
                logged += log_series(
                    service.as_ref(),
                    &run.tracking_id,
                    &format!("global_{}_loss", meta),
                    &losses,
                )
                .await?;
            }
        }
        for artifacts in model.local.values() {
            if let Some(losses) = read_history::<BTreeMap<String, f64>>(artifacts).await? {
                logged += log_series(
                    service.as_ref(),
                    &run.tracking_id,
                    &format!("{}_local_loss", artifacts.origin),
                    &losses,
                )
                .await?;
            }
        }
        Ok(logged)
    }

    /// Log inference statistics. Series are split per class index.
    pub async fn log_performance(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
        statistics: &ParticipantStatistics,
    ) -> FgResult<usize> {
        let (service, run) = self.run_session(key, destination)?;
        let mut logged = 0;
        for per_meta in statistics.values() {
            for inference in per_meta.values() {
                for (name, value) in &inference.statistics {
                    match value {
                        StatValue::Scalar(value) => {
                            service.log_metric(&run.tracking_id, name, *value, 0).await?;
                            logged += 1;
                        }
                        StatValue::Series(values) => {
                            for (index, value) in values.iter().enumerate() {
                                service
                                    .log_metric(
                                        &run.tracking_id,
                                        &format!("{}_class_{}", name, index),
                                        *value,
                                        index as u64 + 1,
                                    )
                                    .await?;
                                logged += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(logged)
    }

    pub async fn log_artifacts(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
        dir: &Path,
    ) -> FgResult<()> {
        let (service, run) = self.run_session(key, destination)?;
        service.log_artifacts(&run.tracking_id, dir).await
    }

    /// Ensure, replay and upload every accumulated combination to each
    /// destination. Destinations are independent: one failing does not stop
    /// the others.
    pub async fn log(
        &self,
        accumulations: &BTreeMap<CombinationKey, ParticipantStatistics>,
        out_dir: &Path,
    ) -> LogReport {
        let mut report = LogReport::default();
        for (destination, uri) in &self.destinations {
            match self
                .log_destination(accumulations, *destination, uri, out_dir)
                .await
            {
                Ok(runs) => {
                    for run in runs {
                        if !report.runs.contains(&run) {
                            report.runs.push(run);
                        }
                    }
                }
                Err(error) => {
                    warn!(uri = %uri, error = %error, "Tracking destination failed");
                    report.failures.push(DestinationFailure {
                        uri: uri.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    async fn log_destination(
        &self,
        accumulations: &BTreeMap<CombinationKey, ParticipantStatistics>,
        destination: TrackingDestination,
        uri: &str,
        out_dir: &Path,
    ) -> FgResult<Vec<String>> {
        let mut runs = Vec::new();
        for (key, statistics) in accumulations {
            self.ensure_experiment(&key.experiment(), destination, uri)
                .await?;
            let run = self.ensure_run(key, destination, uri).await?;
            self.log_losses(key, destination).await?;
            self.log_performance(key, destination, statistics).await?;
            self.log_artifacts(key, destination, &key.result_dir(out_dir))
                .await?;
            runs.push(run.tracking_id);
        }
        Ok(runs)
    }

    fn creation_lock(&self, key: &MappingKey) -> Arc<Mutex<()>> {
        self.creating.entry(key.clone()).or_default().clone()
    }

    /// Store a freshly created mapping. Another process sharing the archive
    /// may have won the race, in which case its mapping is kept and the
    /// entity created here is left orphaned.
    fn record_mapping(&self, mapping: TrackingMapping) -> FgResult<TrackingMapping> {
        let key = mapping.key.clone();
        let uri = mapping.uri.clone();
        let orphan = mapping.tracking_id.clone();
        match self.archive.create_mapping(mapping) {
            Ok(created) => Ok(created),
            Err(create_error) => match self.archive.read_mapping(&key)? {
                Some(existing) => {
                    warn!(
                        record = %key.record,
                        kept = %existing.tracking_id,
                        orphaned = %orphan,
                        "Tracking mapping created concurrently, keeping the archived one"
                    );
                    self.refresh_uri(existing, &key, &uri)
                }
                None => Err(create_error),
            },
        }
    }

    fn refresh_uri(
        &self,
        existing: TrackingMapping,
        key: &MappingKey,
        uri: &str,
    ) -> FgResult<TrackingMapping> {
        if existing.uri == uri {
            return Ok(existing);
        }
        info!(
            record = %key.record,
            from = %existing.uri,
            to = uri,
            "Tracking URI changed"
        );
        self.archive.update_mapping_uri(key, uri)
    }

    fn experiment_mapping(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
    ) -> FgResult<TrackingMapping> {
        let experiment = key.experiment();
        self.archive
            .read_mapping(&experiment_mapping_key(&experiment, destination))?
            .ok_or_else(|| {
                error!(
                    collab_id = %key.collab_id,
                    project_id = %key.project_id,
                    expt_id = %key.expt_id,
                    "Tracking experiment has not been initialised"
                );
                TrackingError::ExperimentNotInitialised { key: experiment }.into()
            })
    }

    fn run_session(
        &self,
        key: &CombinationKey,
        destination: TrackingDestination,
    ) -> FgResult<(Arc<dyn TrackingService>, TrackingMapping)> {
        self.experiment_mapping(key, destination)?;
        let run = self
            .archive
            .read_mapping(&run_mapping_key(key, destination))?
            .ok_or_else(|| {
                error!(
                    expt_id = %key.expt_id,
                    run_id = %key.run_id,
                    "Tracking run has not been initialised"
                );
                TrackingError::RunNotInitialised { key: key.clone() }
            })?;
        Ok((self.factory.service(&run.uri)?, run))
    }
}

async fn read_history<T: serde::de::DeserializeOwned>(
    artifacts: &ModelArtifacts,
) -> FgResult<Option<T>> {
    match tokio::fs::read_to_string(&artifacts.loss_history).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                origin = %artifacts.origin,
                path = %artifacts.loss_history.display(),
                "Loss history missing"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Log `{index: value}` pairs under `name`, skipping non-numeric indices.
async fn log_series(
    service: &dyn TrackingService,
    run_id: &str,
    name: &str,
    losses: &BTreeMap<String, f64>,
) -> FgResult<usize> {
    let mut logged = 0;
    for (index, loss) in losses {
        let Ok(step) = index.parse::<u64>() else {
            warn!(metric = name, index = %index, "Skipping non-numeric loss index");
            continue;
        };
        service.log_metric(run_id, name, *loss, step).await?;
        logged += 1;
    }
    Ok(logged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileTrackingService;
    use crate::service::DefaultServiceFactory;
    use async_trait::async_trait;
    use chrono::Utc;
    use fg_archive::MemoryArchive;
    use fg_types::{
        DatasetMeta, Hyperparameters, InferenceStatistics, MetaStatistics, ModelRecord, RunRecord,
    };
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Unreachable {
        uri: String,
    }

    #[async_trait]
    impl TrackingService for Unreachable {
        fn uri(&self) -> &str {
            &self.uri
        }

        async fn create_experiment(&self, _name: &str) -> FgResult<String> {
            Err(TrackingError::Service {
                uri: self.uri.clone(),
                message: "connection refused".into(),
            }
            .into())
        }

        async fn create_run(&self, _: &str, _: &str, _: &Hyperparameters) -> FgResult<String> {
            self.create_experiment("").await
        }

        async fn log_metric(&self, _: &str, _: &str, _: f64, _: u64) -> FgResult<()> {
            self.create_experiment("").await.map(|_| ())
        }

        async fn log_artifacts(&self, _: &str, _: &Path) -> FgResult<()> {
            self.create_experiment("").await.map(|_| ())
        }
    }

    /// Files for local URIs, an unreachable server for anything remote.
    struct FlakyRemote;

    impl TrackingServiceFactory for FlakyRemote {
        fn service(&self, uri: &str) -> FgResult<Arc<dyn TrackingService>> {
            if uri.starts_with("http") {
                Ok(Arc::new(Unreachable { uri: uri.into() }))
            } else {
                DefaultServiceFactory::new().service(uri)
            }
        }
    }

    /// In-memory service that takes a while to create entities.
    #[derive(Default)]
    struct SlowService {
        created: std::sync::atomic::AtomicUsize,
    }

    impl SlowService {
        async fn create(&self, prefix: &str) -> String {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let n = self
                .created
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("{}-{}", prefix, n)
        }

        fn created(&self) -> usize {
            self.created.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrackingService for SlowService {
        fn uri(&self) -> &str {
            "slow://tracking"
        }

        async fn create_experiment(&self, _name: &str) -> FgResult<String> {
            Ok(self.create("expt").await)
        }

        async fn create_run(&self, _: &str, _: &str, _: &Hyperparameters) -> FgResult<String> {
            Ok(self.create("run").await)
        }

        async fn log_metric(&self, _: &str, _: &str, _: f64, _: u64) -> FgResult<()> {
            Ok(())
        }

        async fn log_artifacts(&self, _: &str, _: &Path) -> FgResult<()> {
            Ok(())
        }
    }

    struct Shared(Arc<SlowService>);

    impl TrackingServiceFactory for Shared {
        fn service(&self, _uri: &str) -> FgResult<Arc<dyn TrackingService>> {
            Ok(self.0.clone())
        }
    }

    fn key() -> CombinationKey {
        CombinationKey::new("collab", "project", "expt", "run")
    }

    fn bridge(archive: Arc<MemoryArchive>, store: &TempDir, remote: Option<&str>) -> TrackingBridge {
        TrackingBridge::new(
            archive,
            Arc::new(FlakyRemote),
            &TrackingSettings {
                local_uri: store.path().to_string_lossy().into_owned(),
                remote_uri: remote.map(String::from),
            },
        )
    }

    fn statistics() -> ParticipantStatistics {
        let mut stats = BTreeMap::new();
        stats.insert("accuracy".to_string(), StatValue::Series(vec![0.8, 0.6]));
        stats.insert("R2".to_string(), StatValue::Scalar(0.5));
        let mut per_meta = MetaStatistics::new();
        per_meta.insert(
            DatasetMeta::Evaluate,
            InferenceStatistics {
                statistics: stats,
                res_path: None,
            },
        );
        let mut all = ParticipantStatistics::new();
        all.insert("alice".to_string(), per_meta);
        all
    }

    #[tokio::test]
    async fn ensure_experiment_is_idempotent_and_tracks_uri() {
        let store = tempdir().unwrap();
        let archive = Arc::new(MemoryArchive::new());
        let bridge = bridge(archive.clone(), &store, None);
        let uri = store.path().to_string_lossy().into_owned();
        let experiment = key().experiment();

        let first = bridge
            .ensure_experiment(&experiment, TrackingDestination::Local, &uri)
            .await
            .unwrap();
        let second = bridge
            .ensure_experiment(&experiment, TrackingDestination::Local, &uri)
            .await
            .unwrap();
        assert_eq!(first.tracking_id, second.tracking_id);
        assert_eq!(first.name, "collab_>_project_>_expt");

        let moved = bridge
            .ensure_experiment(&experiment, TrackingDestination::Local, "/elsewhere")
            .await
            .unwrap();
        assert_eq!(moved.tracking_id, first.tracking_id);
        assert_eq!(moved.uri, "/elsewhere");
    }

    #[tokio::test]
    async fn run_before_experiment_is_an_ordering_error() {
        let store = tempdir().unwrap();
        let archive = Arc::new(MemoryArchive::new());
        let bridge = bridge(archive.clone(), &store, None);
        let uri = store.path().to_string_lossy().into_owned();

        let error = bridge
            .ensure_run(&key(), TrackingDestination::Local, &uri)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            FgError::Tracking(TrackingError::ExperimentNotInitialised { .. })
        ));
        assert_eq!(archive.stats().writes, 0);

        let error = bridge
            .log_performance(&key(), TrackingDestination::Local, &statistics())
            .await
            .unwrap_err();
        assert!(matches!(error, FgError::Tracking(_)));
    }

    #[tokio::test]
    async fn log_replays_losses_statistics_and_artifacts() {
        let store = tempdir().unwrap();
        let results = tempdir().unwrap();
        let archive = Arc::new(MemoryArchive::new());

        let mut hyperparameters = Hyperparameters::new();
        hyperparameters.insert("rounds".into(), json!(2));
        archive.write_run(RunRecord::new(key(), hyperparameters)).unwrap();

        let run_dir = key().result_dir(results.path());
        std::fs::create_dir_all(&run_dir).unwrap();
        let global_losses = run_dir.join("global_loss.json");
        std::fs::write(
            &global_losses,
            json!({"evaluate": {"1": 0.9, "2": 0.4}}).to_string(),
        )
        .unwrap();
        let local_losses = run_dir.join("alice_loss.json");
        std::fs::write(&local_losses, json!({"0": 1.2, "1": 0.7}).to_string()).unwrap();

        let mut local = BTreeMap::new();
        local.insert(
            "alice".to_string(),
            ModelArtifacts {
                origin: "alice".into(),
                path: PathBuf::from("alice.pt"),
                loss_history: local_losses,
            },
        );
        archive
            .write_model(ModelRecord {
                key: key(),
                global: ModelArtifacts {
                    origin: "global".into(),
                    path: PathBuf::from("global.pt"),
                    loss_history: global_losses,
                },
                local,
                created_at: Utc::now(),
            })
            .unwrap();

        let bridge = bridge(archive.clone(), &store, None);
        let mut accumulations = BTreeMap::new();
        accumulations.insert(key(), statistics());
        let report = bridge.log(&accumulations, results.path()).await;

        assert!(report.is_complete());
        assert_eq!(report.runs.len(), 1);
        let run_id = &report.runs[0];
        let service = FileTrackingService::new(&store.path().to_string_lossy());
        assert_eq!(
            service.metric_history(run_id, "global_evaluate_loss").await.unwrap(),
            vec![(0.9, 1), (0.4, 2)]
        );
        assert_eq!(
            service.metric_history(run_id, "alice_local_loss").await.unwrap(),
            vec![(1.2, 0), (0.7, 1)]
        );
        assert_eq!(
            service.metric_history(run_id, "accuracy_class_1").await.unwrap(),
            vec![(0.6, 2)]
        );
        assert_eq!(
            service.metric_history(run_id, "R2").await.unwrap(),
            vec![(0.5, 0)]
        );
        assert_eq!(
            service.params(run_id).await.unwrap(),
            vec![("rounds".to_string(), "2".to_string())]
        );

        // Logging again reuses the same run
        let again = bridge.log(&accumulations, results.path()).await;
        assert_eq!(again.runs, report.runs);
    }

    #[tokio::test]
    async fn failing_remote_does_not_block_local() {
        let store = tempdir().unwrap();
        let archive = Arc::new(MemoryArchive::new());
        let bridge = bridge(archive.clone(), &store, Some("http://tracking.invalid"));
        assert_eq!(bridge.destinations().len(), 2);

        let mut accumulations = BTreeMap::new();
        accumulations.insert(key(), statistics());
        let report = bridge.log(&accumulations, store.path()).await;

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].uri, "http://tracking.invalid");
        assert!(archive
            .read_mapping(&run_mapping_key(&key(), TrackingDestination::Local))
            .unwrap()
            .is_some());
        assert!(archive
            .read_mapping(&experiment_mapping_key(
                &key().experiment(),
                TrackingDestination::Remote
            ))
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ensures_share_one_tracking_entity() {
        let archive = Arc::new(MemoryArchive::new());
        let service = Arc::new(SlowService::default());
        let bridge = TrackingBridge::new(
            archive.clone(),
            Arc::new(Shared(service.clone())),
            &TrackingSettings {
                local_uri: "slow://tracking".into(),
                remote_uri: None,
            },
        );
        let experiment = key().experiment();
        let uri = "slow://tracking";

        let (first, second) = tokio::join!(
            bridge.ensure_experiment(&experiment, TrackingDestination::Local, uri),
            bridge.ensure_experiment(&experiment, TrackingDestination::Local, uri),
        );
        assert_eq!(first.unwrap().tracking_id, second.unwrap().tracking_id);
        assert_eq!(service.created(), 1);

        let run_key = key();
        let (first, second) = tokio::join!(
            bridge.ensure_run(&run_key, TrackingDestination::Local, uri),
            bridge.ensure_run(&run_key, TrackingDestination::Local, uri),
        );
        assert_eq!(first.unwrap().tracking_id, second.unwrap().tracking_id);
        assert_eq!(service.created(), 2);
    }

    #[tokio::test]
    async fn mapping_archived_by_another_writer_wins() {
        let archive = Arc::new(MemoryArchive::new());
        let service = Arc::new(SlowService::default());
        let bridge = TrackingBridge::new(
            archive.clone(),
            Arc::new(Shared(service)),
            &TrackingSettings {
                local_uri: "slow://tracking".into(),
                remote_uri: None,
            },
        );
        let mapping_key = experiment_mapping_key(&key().experiment(), TrackingDestination::Local);
        archive
            .create_mapping(TrackingMapping::new(
                mapping_key.clone(),
                "elsewhere-7",
                "collab_>_project_>_expt",
                "slow://tracking",
            ))
            .unwrap();

        let kept = bridge
            .record_mapping(TrackingMapping::new(
                mapping_key,
                "expt-0",
                "collab_>_project_>_expt",
                "slow://other",
            ))
            .unwrap();
        assert_eq!(kept.tracking_id, "elsewhere-7");
        assert_eq!(kept.uri, "slow://other");
    }
}
