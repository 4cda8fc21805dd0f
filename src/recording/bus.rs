//! Message bus seam for the recording relay

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
}

/// A live connection to the bus, owned by exactly one recording task
#[async_trait]
pub trait MessageBus: Send {
    async fn publish(&mut self, topic: String, payload: Bytes) -> Result<(), BusError>;

    /// Wait until everything published so far has been handed to the broker
    async fn flush(&mut self) -> Result<(), BusError>;

    async fn close(self: Box<Self>);
}

/// Opens bus connections for new recording tasks
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MessageBus>, BusError>;
}

/// Data and end-marker topics for one session
pub fn topics(prefix: &str, session_token: &str) -> (String, String) {
    let data = format!("{}.{}", prefix, session_token);
    let end = format!("{}.end", data);
    (data, end)
}
