//! Queue producers for cluster-mode dispatch.
//!
//! A producer is opened around one batch of publishes and closed again; no
//! connection outlives a dispatch call.

use async_trait::async_trait;
use crossbeam_channel::Sender;
use fg_types::{DispatchError, FgResult, JobMessage, Phase, QueueEndpoint};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection status of a queue producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// What a consumer receives: the target queue plus the job message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub queue: String,
    pub message: JobMessage,
}

#[async_trait]
pub trait QueueProducer: Send {
    async fn connect(&mut self) -> FgResult<()>;

    async fn publish(&mut self, message: &JobMessage) -> FgResult<()>;

    async fn disconnect(&mut self) -> FgResult<()>;

    fn connection_status(&self) -> ConnectionStatus;
}

/// Builds a producer for one phase queue at one endpoint.
pub trait ProducerFactory: Send + Sync {
    fn producer(&self, phase: Phase, endpoint: &QueueEndpoint) -> Box<dyn QueueProducer>;
}

/// Publishes newline-delimited JSON over TCP.
pub struct TcpQueueProducer {
    phase: Phase,
    endpoint: QueueEndpoint,
    stream: Option<BufWriter<TcpStream>>,
}

impl TcpQueueProducer {
    pub fn new(phase: Phase, endpoint: QueueEndpoint) -> Self {
        Self {
            phase,
            endpoint,
            stream: None,
        }
    }

    fn publish_error(&self, message: &JobMessage, detail: impl ToString) -> DispatchError {
        DispatchError::Publish {
            key: message.key.clone(),
            phase: self.phase,
            message: detail.to_string(),
        }
    }
}

#[async_trait]
impl QueueProducer for TcpQueueProducer {
    async fn connect(&mut self) -> FgResult<()> {
        let address = self.endpoint.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| DispatchError::Connect {
                phase: self.phase,
                endpoint: address.clone(),
                message: e.to_string(),
            })?;
        debug!(queue = %self.phase, endpoint = %address, "Queue connection opened");
        self.stream = Some(BufWriter::new(stream));
        Ok(())
    }

    async fn publish(&mut self, message: &JobMessage) -> FgResult<()> {
        let envelope = QueuedJob {
            queue: self.phase.queue_name().to_string(),
            message: message.clone(),
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let written = match self.stream.as_mut() {
            Some(stream) => stream.write_all(&line).await,
            None => return Err(self.publish_error(message, "producer is not connected").into()),
        };
        written.map_err(|e| self.publish_error(message, e).into())
    }

    async fn disconnect(&mut self) -> FgResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.flush().await?;
            stream.shutdown().await?;
            debug!(queue = %self.phase, "Queue connection closed");
        }
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.stream.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProducerFactory;

impl ProducerFactory for TcpProducerFactory {
    fn producer(&self, phase: Phase, endpoint: &QueueEndpoint) -> Box<dyn QueueProducer> {
        Box::new(TcpQueueProducer::new(phase, endpoint.clone()))
    }
}

/// Hands jobs to an in-process consumer over a crossbeam channel.
pub struct ChannelQueueProducer {
    phase: Phase,
    sender: Sender<QueuedJob>,
    connected: bool,
}

impl ChannelQueueProducer {
    pub fn new(phase: Phase, sender: Sender<QueuedJob>) -> Self {
        Self {
            phase,
            sender,
            connected: false,
        }
    }
}

#[async_trait]
impl QueueProducer for ChannelQueueProducer {
    async fn connect(&mut self) -> FgResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn publish(&mut self, message: &JobMessage) -> FgResult<()> {
        let publish_error = |detail: &str| DispatchError::Publish {
            key: message.key.clone(),
            phase: self.phase,
            message: detail.to_string(),
        };
        if !self.connected {
            return Err(publish_error("producer is not connected").into());
        }
        self.sender
            .send(QueuedJob {
                queue: self.phase.queue_name().to_string(),
                message: message.clone(),
            })
            .map_err(|_| publish_error("consumer hung up"))?;
        Ok(())
    }

    async fn disconnect(&mut self) -> FgResult<()> {
        self.connected = false;
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelProducerFactory {
    sender: Sender<QueuedJob>,
}

impl ChannelProducerFactory {
    pub fn new(sender: Sender<QueuedJob>) -> Self {
        Self { sender }
    }
}

impl ProducerFactory for ChannelProducerFactory {
    fn producer(&self, phase: Phase, _endpoint: &QueueEndpoint) -> Box<dyn QueueProducer> {
        Box::new(ChannelQueueProducer::new(phase, self.sender.clone()))
    }
}
