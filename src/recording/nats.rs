//! NATS-backed message bus

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::bus::{BusConnector, BusError, MessageBus};

/// Connects to NATS with unlimited reconnects and a retrying initial connect
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> Result<Box<dyn MessageBus>, BusError> {
        let client = ConnectOptions::new()
            .max_reconnects(None::<usize>)
            .retry_on_initial_connect()
            .connect(self.url.as_str())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = %self.url, "connected to recording bus");
        Ok(Box::new(NatsBus { client }))
    }
}

struct NatsBus {
    client: Client,
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&mut self, topic: String, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic.clone(), payload)
            .await
            .map_err(|e| BusError::Publish {
                topic,
                reason: e.to_string(),
            })
    }

    async fn flush(&mut self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Flush(e.to_string()))
    }

    async fn close(self: Box<Self>) {
        debug!("closing recording bus connection");
        drop(self.client);
    }
}
