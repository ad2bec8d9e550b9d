use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config_error;
use crate::errors::FgResult;

/// How jobs are executed. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Publish to the phase queues; a separate consumer executes.
    Cluster,
    /// Execute in-process, one combination at a time.
    Standalone,
}

impl FromStr for DispatchMode {
    type Err = crate::FgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" => Ok(Self::Cluster),
            "standalone" => Ok(Self::Standalone),
            other => Err(config_error!("unknown dispatch mode '{}'", other)),
        }
    }
}

/// Address of a queue broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEndpoint {
    pub host: String,
    pub port: u16,
}

impl QueueEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSettings {
    /// Always logged to.
    pub local_uri: String,
    #[serde(default)]
    pub remote_uri: Option<String>,
}

/// Static compute budget shared by search trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cores: f64,
    #[serde(default)]
    pub gpus: f64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0),
            gpus: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSettings {
    /// Fixed re-check interval of the trial completion barrier.
    pub poll_interval_ms: u64,
    /// Upper bound on how long a trial waits for every participant.
    pub trial_timeout_secs: u64,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            trial_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcSettings {
    pub timeout_secs: u64,
    #[serde(default)]
    pub secure: bool,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            secure: false,
        }
    }
}

/// Coordinator configuration, passed explicitly into every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub mode: DispatchMode,
    /// Queue used by collaborations without their own endpoint.
    pub queue: Option<QueueEndpoint>,
    pub collaboration_queues: HashMap<String, QueueEndpoint>,
    /// Which registered grid a cycle runs on.
    pub grid_index: usize,
    pub out_dir: PathBuf,
    pub tracking: TrackingSettings,
    pub resources: ResourceBudget,
    pub optimization: OptimizationSettings,
    pub rpc: RpcSettings,
    /// Address of the status endpoint served by the coordinator binary.
    pub status_addr: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fedgrid");

        Self {
            mode: DispatchMode::Standalone,
            queue: None,
            collaboration_queues: HashMap::new(),
            grid_index: 0,
            out_dir: data_dir.join("outputs"),
            tracking: TrackingSettings {
                local_uri: data_dir.join("mlruns").to_string_lossy().into_owned(),
                remote_uri: None,
            },
            resources: ResourceBudget::default(),
            optimization: OptimizationSettings::default(),
            rpc: RpcSettings::default(),
            status_addr: "0.0.0.0:8082".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> FgResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `FEDGRID_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> FgResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> FgResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("FEDGRID_MODE") {
            self.mode = mode.parse()?;
        }

        match (lookup("FEDGRID_QUEUE_HOST"), lookup("FEDGRID_QUEUE_PORT")) {
            (Some(host), Some(port)) => {
                self.queue = Some(QueueEndpoint {
                    host,
                    port: parse_var("FEDGRID_QUEUE_PORT", &port)?,
                });
            }
            (Some(host), None) => match self.queue.as_mut() {
                Some(queue) => queue.host = host,
                None => {
                    return Err(config_error!(
                        "FEDGRID_QUEUE_HOST set without FEDGRID_QUEUE_PORT"
                    ))
                }
            },
            (None, Some(port)) => match self.queue.as_mut() {
                Some(queue) => queue.port = parse_var("FEDGRID_QUEUE_PORT", &port)?,
                None => {
                    return Err(config_error!(
                        "FEDGRID_QUEUE_PORT set without FEDGRID_QUEUE_HOST"
                    ))
                }
            },
            (None, None) => {}
        }

        if let Some(index) = lookup("FEDGRID_GRID_INDEX") {
            self.grid_index = parse_var("FEDGRID_GRID_INDEX", &index)?;
        }
        if let Some(out_dir) = lookup("FEDGRID_OUT_DIR") {
            self.out_dir = PathBuf::from(out_dir);
        }
        if let Some(uri) = lookup("FEDGRID_TRACKING_LOCAL_URI") {
            self.tracking.local_uri = uri;
        }
        if let Some(uri) = lookup("FEDGRID_TRACKING_REMOTE_URI") {
            self.tracking.remote_uri = Some(uri).filter(|uri| !uri.is_empty());
        }
        if let Some(cores) = lookup("FEDGRID_CORES") {
            self.resources.cores = parse_var("FEDGRID_CORES", &cores)?;
        }
        if let Some(gpus) = lookup("FEDGRID_GPUS") {
            self.resources.gpus = parse_var("FEDGRID_GPUS", &gpus)?;
        }
        if let Some(addr) = lookup("FEDGRID_STATUS_ADDR") {
            self.status_addr = addr;
        }
        Ok(())
    }

    /// Startup checks. Per-collaboration queue resolution is still checked
    /// on every cluster dispatch.
    pub fn validate(&self) -> FgResult<()> {
        if self.mode == DispatchMode::Cluster
            && self.queue.is_none()
            && self.collaboration_queues.is_empty()
        {
            return Err(config_error!(
                "cluster mode requires a queue endpoint (set `queue` or FEDGRID_QUEUE_HOST/PORT)"
            ));
        }
        if self.resources.cores <= 0.0 {
            return Err(config_error!("resource budget needs at least some cores"));
        }
        if self.resources.gpus < 0.0 {
            return Err(config_error!("gpu budget cannot be negative"));
        }
        if self.optimization.poll_interval_ms == 0 {
            return Err(config_error!("poll_interval_ms must be positive"));
        }
        if self.tracking.local_uri.is_empty() {
            return Err(config_error!("a local tracking uri is required"));
        }
        Ok(())
    }

    /// Queue endpoint for a collaboration, if any is configured.
    pub fn queue_for(&self, collab_id: &str) -> Option<&QueueEndpoint> {
        self.collaboration_queues
            .get(collab_id)
            .or(self.queue.as_ref())
    }

    /// Every tracking destination, local first.
    pub fn tracking_uris(&self) -> Vec<&str> {
        let mut uris = vec![self.tracking.local_uri.as_str()];
        if let Some(remote) = self.tracking.remote_uri.as_deref() {
            uris.push(remote);
        }
        uris
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> FgResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| config_error!("invalid value '{}' for {}", value, name))
}
