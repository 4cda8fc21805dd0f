//! In-memory message bus with fault injection
//!
//! Records every publish in order. Clones share state, so a test keeps one
//! handle while the relay owns another.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::recording::{BusConnector, BusError, MessageBus};

#[derive(Debug, Default)]
struct State {
    messages: Vec<(String, Bytes)>,
    flush_failures_left: u32,
    flush_attempts: u32,
    fail_publishes: bool,
    fail_connect: bool,
    connects: u32,
    closed: bool,
}

/// Shared in-memory bus
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` flushes
    pub fn fail_flushes(self, count: u32) -> Self {
        self.lock().flush_failures_left = count;
        self
    }

    /// Reject every publish
    pub fn fail_publishes(self) -> Self {
        self.lock().fail_publishes = true;
        self
    }

    /// Refuse connections
    pub fn fail_connect(self) -> Self {
        self.lock().fail_connect = true;
        self
    }

    /// Everything published so far, in publish order
    pub fn messages(&self) -> Vec<(String, Bytes)> {
        self.lock().messages.clone()
    }

    /// Payloads published on one topic, in order
    pub fn payloads(&self, topic: &str) -> Vec<Bytes> {
        self.lock()
            .messages
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn flush_attempts(&self) -> u32 {
        self.lock().flush_attempts
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// True once a connection was closed after a successful flush
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded messages
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<Box<dyn MessageBus>, BusError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(BusError::Connect("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&mut self, topic: String, payload: Bytes) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.fail_publishes {
            return Err(BusError::Publish {
                topic,
                reason: "rejected".to_string(),
            });
        }
        state.messages.push((topic, payload));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BusError> {
        let mut state = self.lock();
        state.flush_attempts += 1;
        if state.flush_failures_left > 0 {
            state.flush_failures_left -= 1;
            return Err(BusError::Flush("broker unavailable".to_string()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.lock().closed = true;
    }
}
