//! Session recording relay
//!
//! Two halves joined by a bounded channel: the session task holds the
//! [`Recorder`] and is the only writer; a dedicated recording task drains the
//! channel and republishes every chunk, in order, to `<topic>.<token>`. When the
//! recorder is closed the task publishes `EOF` to `<topic>.<token>.end`, flushes
//! until the broker has it, then releases the bus connection.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::bus::{topics, BusConnector, BusError, MessageBus};
use super::retry::FlushRetry;
use crate::config::RecordingConfig;
use crate::metrics;
use crate::session::Session;

/// Payload of the end-of-session marker
pub const END_MARKER: &[u8] = b"EOF";

#[derive(Debug, Error)]
pub enum RecordingError {
    /// The recording task is gone; bytes can no longer be recorded in order
    #[error("recording relay closed")]
    RelayClosed,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("recording task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Write half, held by the session
#[derive(Debug)]
pub struct Recorder {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl Recorder {
    /// A recorder that drops everything; used when recording is not configured
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue bytes for the recording task
    ///
    /// Fails only if the recording task has died, at which point the session
    /// can no longer be recorded faithfully and must end.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), RecordingError> {
        let Some(ref tx) = self.tx else {
            return Ok(());
        };
        tx.send(data.into())
            .await
            .map_err(|_| RecordingError::RelayClosed)
    }

    /// Signal end of session. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

/// Counters reported by a finished recording task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Flush attempts that failed before the final successful one
    pub flush_retries: u32,
}

/// Read half, running as its own task
#[derive(Debug)]
pub struct RecordingRelay {
    task: JoinHandle<Result<RelayStats, RecordingError>>,
}

impl RecordingRelay {
    /// Wait for the end marker to be flushed and the bus connection released
    ///
    /// Close (or drop) the matching [`Recorder`] first, otherwise this waits forever.
    pub async fn finish(self) -> Result<RelayStats, RecordingError> {
        self.task.await?
    }
}

/// Start the recording task for a session
///
/// The task runs on `tracker` rather than under the session, so it still
/// publishes and flushes the end marker if the session task is aborted.
pub fn spawn_relay(
    session: &Session,
    config: &RecordingConfig,
    connector: Arc<dyn BusConnector>,
    tracker: &TaskTracker,
) -> (Recorder, RecordingRelay) {
    let (tx, rx) = mpsc::channel(config.buffer_chunks.max(1));
    let (data_topic, end_topic) = topics(&config.topic, &session.session_token);
    let retry = FlushRetry::with_delay(config.flush_retry_delay());

    info!(session = %session.obfuscated_session_token, "enabling session recording");

    let span = tracing::info_span!("recording", session = %session.obfuscated_session_token);
    let task = tracker.spawn(
        async move { relay_loop(rx, data_topic, end_topic, connector, retry).await }
            .instrument(span),
    );

    (Recorder { tx: Some(tx) }, RecordingRelay { task })
}

async fn relay_loop(
    mut rx: mpsc::Receiver<Bytes>,
    data_topic: String,
    end_topic: String,
    connector: Arc<dyn BusConnector>,
    mut retry: FlushRetry,
) -> Result<RelayStats, RecordingError> {
    let mut endpoint = RecordingEndpoint::new(connector.connect().await?);
    let mut stats = RelayStats::default();

    while let Some(chunk) = rx.recv().await {
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len();
        debug!(len, "recording chunk");
        endpoint.publish(data_topic.clone(), chunk).await?;
        stats.chunks += 1;
        stats.bytes += len as u64;
        metrics::record_bytes(len);
    }

    endpoint
        .publish(end_topic, Bytes::from_static(END_MARKER))
        .await?;
    stats.flush_retries = endpoint.flush_until_sent(&mut retry).await;
    endpoint.close().await;

    debug!(chunks = stats.chunks, bytes = stats.bytes, "recording finished");
    Ok(stats)
}

/// Owns the bus connection for the lifetime of one recording task
struct RecordingEndpoint {
    bus: Option<Box<dyn MessageBus>>,
}

impl RecordingEndpoint {
    fn new(bus: Box<dyn MessageBus>) -> Self {
        Self { bus: Some(bus) }
    }

    async fn publish(&mut self, topic: String, payload: Bytes) -> Result<(), BusError> {
        match self.bus {
            Some(ref mut bus) => bus.publish(topic, payload).await,
            None => Err(BusError::Publish {
                topic,
                reason: "connection released".to_string(),
            }),
        }
    }

    /// Flush until the broker confirms; never gives up. Returns the number of failures.
    async fn flush_until_sent(&mut self, retry: &mut FlushRetry) -> u32 {
        let Some(ref mut bus) = self.bus else {
            return retry.attempt();
        };
        loop {
            match bus.flush().await {
                Ok(()) => return retry.attempt(),
                Err(e) => {
                    let delay = retry.next_delay();
                    warn!(error = %e, attempt = retry.attempt(), "flush failed, retrying in {:?}", delay);
                    metrics::record_flush_retry();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn close(mut self) {
        if let Some(bus) = self.bus.take() {
            bus.close().await;
        }
    }
}

impl Drop for RecordingEndpoint {
    fn drop(&mut self) {
        if self.bus.is_some() {
            debug!("releasing recording bus connection without close");
        }
    }
}
