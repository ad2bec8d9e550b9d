//! Directory-backed tracking store.
//!
//! Layout: `{root}/{experiment_id}/{run_id}/{metrics,params,artifacts}`.
//! Each metric is a file of `timestamp value step` lines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fg_types::{internal_error, FgResult, Hyperparameters, TrackingError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::service::{param_value, TrackingService};

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RunMeta {
    run_id: String,
    run_name: String,
    experiment_id: String,
    start_time: i64,
}

#[derive(Debug, Clone)]
pub struct FileTrackingService {
    uri: String,
    root: PathBuf,
}

impl FileTrackingService {
    pub fn new(uri: &str) -> Self {
        let root = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        Self {
            uri: uri.to_string(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate a run directory by scanning experiments.
    async fn run_dir(&self, run_id: &str) -> FgResult<PathBuf> {
        let mut experiments = fs::read_dir(&self.root).await?;
        while let Some(experiment) = experiments.next_entry().await? {
            let candidate = experiment.path().join(run_id);
            if fs::metadata(candidate.join(META_FILE)).await.is_ok() {
                return Ok(candidate);
            }
        }
        Err(TrackingError::Service {
            uri: self.uri.clone(),
            message: format!("unknown run '{}'", run_id),
        }
        .into())
    }

    /// Recorded `(value, step)` pairs of one metric, in logging order.
    pub async fn metric_history(&self, run_id: &str, key: &str) -> FgResult<Vec<(f64, u64)>> {
        let path = self.run_dir(run_id).await?.join("metrics").join(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .map(|line| -> FgResult<(f64, u64)> {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    [_, value, step] => Ok((
                        value.parse::<f64>().map_err(|_| self.corrupt(&path))?,
                        step.parse::<u64>().map_err(|_| self.corrupt(&path))?,
                    )),
                    _ => Err(self.corrupt(&path)),
                }
            })
            .collect()
    }

    /// Logged parameters of a run.
    pub async fn params(&self, run_id: &str) -> FgResult<Vec<(String, String)>> {
        let mut entries = fs::read_dir(self.run_dir(run_id).await?.join("params")).await?;
        let mut params = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let value = fs::read_to_string(entry.path()).await?;
            params.push((entry.file_name().to_string_lossy().into_owned(), value));
        }
        params.sort();
        Ok(params)
    }

    fn corrupt(&self, path: &Path) -> fg_types::FgError {
        TrackingError::Service {
            uri: self.uri.clone(),
            message: format!("corrupt metric file {}", path.display()),
        }
        .into()
    }
}

#[async_trait]
impl TrackingService for FileTrackingService {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_experiment(&self, name: &str) -> FgResult<String> {
        let experiment_id = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(&experiment_id);
        fs::create_dir_all(&dir).await?;

        let meta = ExperimentMeta {
            experiment_id: experiment_id.clone(),
            name: name.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;
        debug!(uri = %self.uri, experiment_id = %experiment_id, name, "Created tracking experiment");
        Ok(experiment_id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        params: &Hyperparameters,
    ) -> FgResult<String> {
        let experiment_dir = self.root.join(experiment_id);
        if fs::metadata(experiment_dir.join(META_FILE)).await.is_err() {
            return Err(TrackingError::Service {
                uri: self.uri.clone(),
                message: format!("unknown experiment '{}'", experiment_id),
            }
            .into());
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = experiment_dir.join(&run_id);
        for section in ["metrics", "params", "artifacts"] {
            fs::create_dir_all(run_dir.join(section)).await?;
        }
        for (key, value) in params {
            fs::write(run_dir.join("params").join(key), param_value(value)).await?;
        }

        let meta = RunMeta {
            run_id: run_id.clone(),
            run_name: name.to_string(),
            experiment_id: experiment_id.to_string(),
            start_time: Utc::now().timestamp_millis(),
        };
        fs::write(run_dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;
        Ok(run_id)
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> FgResult<()> {
        let path = self.run_dir(run_id).await?.join("metrics").join(key);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let line = format!("{} {} {}\n", Utc::now().timestamp_millis(), value, step);
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn log_artifacts(&self, run_id: &str, dir: &Path) -> FgResult<()> {
        if fs::metadata(dir).await.is_err() {
            warn!(run_id, dir = %dir.display(), "No result artifacts to log");
            return Ok(());
        }
        let target = self.run_dir(run_id).await?.join("artifacts");
        let source = dir.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| internal_error!("artifact copy task failed: {}", e))??;
        Ok(())
    }
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}
