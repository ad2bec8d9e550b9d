use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fg_types::{FgResult, Hyperparameters};

use crate::file::FileTrackingService;
use crate::rest::RestTrackingService;

/// Primitives of an experiment-tracking service.
#[async_trait]
pub trait TrackingService: Send + Sync {
    /// URI this service talks to.
    fn uri(&self) -> &str;

    /// Create an experiment and return its tracking id.
    async fn create_experiment(&self, name: &str) -> FgResult<String>;

    /// Start a run under `experiment_id`, logging `params`, and return its
    /// tracking id.
    async fn create_run(
        &self,
        experiment_id: &str,
        name: &str,
        params: &Hyperparameters,
    ) -> FgResult<String>;

    async fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> FgResult<()>;

    /// Upload every file under `dir` as run artifacts.
    async fn log_artifacts(&self, run_id: &str, dir: &Path) -> FgResult<()>;
}

/// Resolves a tracking URI to a service.
pub trait TrackingServiceFactory: Send + Sync {
    fn service(&self, uri: &str) -> FgResult<Arc<dyn TrackingService>>;
}

/// `http(s)://` URIs talk REST; anything else is a local directory.
#[derive(Debug, Clone, Default)]
pub struct DefaultServiceFactory {
    client: reqwest::Client,
}

impl DefaultServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TrackingServiceFactory for DefaultServiceFactory {
    fn service(&self, uri: &str) -> FgResult<Arc<dyn TrackingService>> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            Ok(Arc::new(RestTrackingService::with_client(
                self.client.clone(),
                uri,
            )))
        } else {
            Ok(Arc::new(FileTrackingService::new(uri)))
        }
    }
}

/// Human-readable rendering of a parameter value.
pub(crate) fn param_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_picks_service_by_scheme() {
        let factory = DefaultServiceFactory::new();
        let remote = factory.service("http://tracking.local:5000").unwrap();
        assert_eq!(remote.uri(), "http://tracking.local:5000");

        let local = factory.service("/tmp/mlruns").unwrap();
        assert_eq!(local.uri(), "/tmp/mlruns");
    }

    #[test]
    fn params_render_without_quotes() {
        assert_eq!(param_value(&json!("adam")), "adam");
        assert_eq!(param_value(&json!(0.01)), "0.01");
        assert_eq!(param_value(&json!([1, 2])), "[1,2]");
    }
}
