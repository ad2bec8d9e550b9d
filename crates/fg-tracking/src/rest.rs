//! Tracking server client speaking the MLflow 2.0 REST API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fg_types::{internal_error, FgResult, Hyperparameters, TrackingError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::service::{param_value, TrackingService};

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACT_PREFIX: &str = "api/2.0/mlflow-artifacts/artifacts";

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: Run,
}

#[derive(Debug, Serialize)]
struct Param {
    key: String,
    value: String,
}

#[derive(Debug, Clone)]
pub struct RestTrackingService {
    client: reqwest::Client,
    uri: String,
}

impl RestTrackingService {
    pub fn new(uri: &str) -> Self {
        Self::with_client(reqwest::Client::new(), uri)
    }

    pub fn with_client(client: reqwest::Client, uri: &str) -> Self {
        Self {
            client,
            uri: uri.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.uri, API_PREFIX, path)
    }

    fn service_error(&self, message: impl ToString) -> fg_types::FgError {
        TrackingError::Service {
            uri: self.uri.clone(),
            message: message.to_string(),
        }
        .into()
    }

    async fn post<R: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> FgResult<R> {
        let url = self.endpoint(path);
        debug!(url = %url, "Calling tracking server");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.service_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(self.service_error(format!("{} replied {}: {}", path, status, detail)));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| self.service_error(format!("malformed {} reply: {}", path, e)))
    }
}

#[async_trait]
impl TrackingService for RestTrackingService {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_experiment(&self, name: &str) -> FgResult<String> {
        let response: CreateExperimentResponse = self
            .post("experiments/create", json!({ "name": name }))
            .await?;
        Ok(response.experiment_id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        params: &Hyperparameters,
    ) -> FgResult<String> {
        let response: CreateRunResponse = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": name,
                    "start_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        let run_id = response.run.info.run_id;

        if !params.is_empty() {
            let params: Vec<Param> = params
                .iter()
                .map(|(key, value)| Param {
                    key: key.clone(),
                    value: param_value(value),
                })
                .collect();
            let _: serde_json::Value = self
                .post("runs/log-batch", json!({ "run_id": run_id, "params": params }))
                .await?;
        }
        Ok(run_id)
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> FgResult<()> {
        let _: serde_json::Value = self
            .post(
                "runs/log-metric",
                json!({
                    "run_id": run_id,
                    "key": key,
                    "value": value,
                    "timestamp": Utc::now().timestamp_millis(),
                    "step": step,
                }),
            )
            .await?;
        Ok(())
    }

    async fn log_artifacts(&self, run_id: &str, dir: &Path) -> FgResult<()> {
        if tokio::fs::metadata(dir).await.is_err() {
            warn!(run_id, dir = %dir.display(), "No result artifacts to log");
            return Ok(());
        }
        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(|e| internal_error!("artifact scan task failed: {}", e))??;

        for file in files {
            let relative = file
                .strip_prefix(dir)
                .map_err(|e| internal_error!("artifact outside result dir: {}", e))?;
            let url = format!(
                "{}/{}/{}/{}",
                self.uri,
                ARTIFACT_PREFIX,
                run_id,
                relative.to_string_lossy()
            );
            let content = tokio::fs::read(&file).await?;
            let response = self
                .client
                .put(&url)
                .body(content)
                .send()
                .await
                .map_err(|e| self.service_error(e))?;
            if !response.status().is_success() {
                return Err(self.service_error(format!(
                    "artifact upload of {} replied {}",
                    relative.display(),
                    response.status()
                )));
            }
        }
        Ok(())
    }
}

fn list_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            files.extend(list_files(&entry.path())?);
        } else {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read one full HTTP request (headers plus `Content-Length` body).
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&received).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= split + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&received).to_string()
    }

    /// Answer each incoming request with the next canned body, recording
    /// request lines.
    async fn serve(replies: Vec<&'static str>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            for body in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let first_line = request.lines().next().unwrap_or_default().to_string();
                recorded.lock().unwrap().push(first_line);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://127.0.0.1:{}/", port), seen)
    }

    fn service(uri: &str) -> RestTrackingService {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        RestTrackingService::with_client(client, uri)
    }

    #[tokio::test]
    async fn creates_experiment_and_run_with_params() {
        let (uri, seen) = serve(vec![
            r#"{"experiment_id": "7"}"#,
            r#"{"run": {"info": {"run_id": "abc"}}}"#,
            r#"{}"#,
        ])
        .await;
        let service = service(&uri);

        assert_eq!(service.create_experiment("c_>_p_>_e").await.unwrap(), "7");
        let mut params = Hyperparameters::new();
        params.insert("lr".into(), json!(0.1));
        assert_eq!(service.create_run("7", "r", &params).await.unwrap(), "abc");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "POST /api/2.0/mlflow/experiments/create HTTP/1.1",
                "POST /api/2.0/mlflow/runs/create HTTP/1.1",
                "POST /api/2.0/mlflow/runs/log-batch HTTP/1.1",
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_service_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let service = service(&format!("http://127.0.0.1:{}", port));
        let error = service.log_metric("abc", "accuracy", 0.5, 0).await.unwrap_err();
        assert!(matches!(
            error,
            fg_types::FgError::Tracking(TrackingError::Service { .. })
        ));
    }
}
