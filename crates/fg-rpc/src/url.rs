use fg_types::{CombinationKey, GridEntry, ProjectKey};

/// Builds worker REST-RPC endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlConstructor {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl UrlConstructor {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Endpoint of a grid entry's REST-RPC service.
    pub fn for_entry(entry: &GridEntry, secure: bool) -> Self {
        Self::new(entry.address.host.clone(), entry.address.f_port, secure)
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn poll_url(&self, key: &ProjectKey) -> String {
        format!(
            "{}/worker/poll/{}/{}",
            self.base_url(),
            key.collab_id,
            key.project_id
        )
    }

    pub fn predict_url(&self, key: &CombinationKey) -> String {
        let [collab_id, project_id, expt_id, run_id] = key.segments();
        format!(
            "{}/worker/predict/{}/{}/{}/{}",
            self.base_url(),
            collab_id,
            project_id,
            expt_id,
            run_id
        )
    }
}
