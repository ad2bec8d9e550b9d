use std::time::Duration;

use async_trait::async_trait;
use fg_types::{
    CombinationKey, DatasetHeaders, FgError, FgResult, GridEntry, JobKey, ProjectKey, RpcError,
    RpcSettings,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::payload::{HeadersRequest, HeadersResponse, InferenceRequest, InferenceResponse};
use crate::url::UrlConstructor;

/// Calls made by the coordinator into a participant's worker node.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Ask a worker for the column headers of its tagged datasets.
    async fn poll_headers(
        &self,
        key: &ProjectKey,
        entry: &GridEntry,
        request: &HeadersRequest,
    ) -> FgResult<DatasetHeaders>;

    /// Submit inference references and receive computed statistics.
    async fn infer(
        &self,
        key: &CombinationKey,
        entry: &GridEntry,
        request: &InferenceRequest,
    ) -> FgResult<InferenceResponse>;
}

/// `WorkerRpc` over HTTP JSON.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    secure: bool,
}

impl HttpWorkerClient {
    pub fn new(settings: &RpcSettings) -> FgResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| FgError::Config(format!("failed to build worker client: {}", e)))?;
        Ok(Self {
            client,
            secure: settings.secure,
        })
    }

    pub fn with_client(client: reqwest::Client, secure: bool) -> Self {
        Self { client, secure }
    }

    async fn post<B, R>(&self, url: &str, key: JobKey, entry: &GridEntry, body: &B) -> FgResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let participant_id = entry.participant_id.clone();
        debug!(participant_id = %participant_id, url = %url, "Posting to worker");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Request {
                key: key.clone(),
                participant_id: participant_id.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RpcError::Request {
                key,
                participant_id,
                message: format!("worker replied {}: {}", status, detail),
            }
            .into());
        }

        response.json::<R>().await.map_err(|e| {
            RpcError::MalformedResponse {
                key,
                participant_id,
                message: e.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl WorkerRpc for HttpWorkerClient {
    async fn poll_headers(
        &self,
        key: &ProjectKey,
        entry: &GridEntry,
        request: &HeadersRequest,
    ) -> FgResult<DatasetHeaders> {
        let url = UrlConstructor::for_entry(entry, self.secure).poll_url(key);
        let response: HeadersResponse = self
            .post(&url, key.clone().into(), entry, request)
            .await?;
        Ok(response.headers)
    }

    async fn infer(
        &self,
        key: &CombinationKey,
        entry: &GridEntry,
        request: &InferenceRequest,
    ) -> FgResult<InferenceResponse> {
        let url = UrlConstructor::for_entry(entry, self.secure).predict_url(key);
        self.post(&url, key.clone().into(), entry, request).await
    }
}
