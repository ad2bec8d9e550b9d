//! JSON status endpoint of the coordinator service.

use std::sync::Arc;

use fg_types::{DispatchMode, FgResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::coordinator::Coordinator;

pub const SERVICE_NAME: &str = "fedgrid-coordinator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    pub service: String,
    pub mode: DispatchMode,
    pub grids: usize,
    pub grid_index: usize,
    pub tracking: Vec<String>,
    /// Number of archive writes so far.
    pub archive_revision: u64,
}

impl StatusReport {
    pub fn from_coordinator(coordinator: &Coordinator) -> Self {
        let status = match coordinator.grid() {
            Ok(_) => "ok",
            Err(_) => "degraded",
        };
        Self {
            status: status.to_string(),
            service: SERVICE_NAME.to_string(),
            mode: coordinator.mode(),
            grids: coordinator.grids().len(),
            grid_index: coordinator.config().grid_index,
            tracking: coordinator
                .bridge()
                .destinations()
                .iter()
                .map(|(_, uri)| uri.clone())
                .collect(),
            archive_revision: *coordinator.archive().subscribe().borrow(),
        }
    }
}

/// Answer every connection with the current status until accepting fails.
pub async fn serve_status(listener: TcpListener, coordinator: Arc<Coordinator>) -> FgResult<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(peer = %peer, "Status request");
        let report = StatusReport::from_coordinator(&coordinator);
        tokio::spawn(async move {
            if let Err(error) = respond(socket, &report).await {
                warn!(peer = %peer, error = %error, "Status response failed");
            }
        });
    }
}

async fn respond(mut socket: TcpStream, report: &StatusReport) -> FgResult<()> {
    let mut buffer = [0u8; 1024];
    let _ = socket.read(&mut buffer).await?;

    let body = serde_json::to_string(report)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::ArchiveEnumerator;
    use fg_archive::{Archive, MemoryArchive};
    use fg_engine::{build_dispatcher, RunnerRegistry, TcpProducerFactory};
    use fg_tracking::DefaultServiceFactory;
    use fg_types::{CoordinatorConfig, ExperimentKey, Grid, RunRecord, TrackingSettings};

    fn coordinator(root: &std::path::Path) -> Arc<Coordinator> {
        let config = CoordinatorConfig {
            tracking: TrackingSettings {
                local_uri: root.to_string_lossy().into_owned(),
                remote_uri: Some("http://tracking.local:5000".into()),
            },
            ..Default::default()
        };
        let archive = Arc::new(MemoryArchive::new());
        archive
            .write_run(RunRecord::new(
                ExperimentKey::new("collab", "project", "expt").run("run_1"),
                Default::default(),
            ))
            .unwrap();
        let dispatcher = build_dispatcher(
            &config,
            Arc::new(TcpProducerFactory),
            RunnerRegistry::new(),
            archive.clone(),
        );
        Arc::new(Coordinator::new(
            config,
            archive.clone(),
            Arc::new(ArchiveEnumerator::new(archive)),
            vec![Grid::default()],
            dispatcher,
            Arc::new(DefaultServiceFactory::new()),
        ))
    }

    #[test]
    fn report_describes_the_coordinator() {
        let root = tempfile::tempdir().unwrap();
        let report = StatusReport::from_coordinator(&coordinator(root.path()));
        assert_eq!(report.status, "ok");
        assert_eq!(report.mode, DispatchMode::Standalone);
        assert_eq!(report.grids, 1);
        assert_eq!(report.tracking.len(), 2);
        assert_eq!(report.archive_revision, 1);
    }

    #[tokio::test]
    async fn endpoint_answers_with_json() {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, coordinator(root.path())));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let report: StatusReport = serde_json::from_str(body).unwrap();
        assert_eq!(report.service, SERVICE_NAME);
        assert_eq!(report.status, "ok");
    }
}
