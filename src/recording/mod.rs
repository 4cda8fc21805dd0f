//! Session recording to a message bus

mod bus;
mod nats;
mod relay;
mod retry;

pub use bus::{topics, BusConnector, BusError, MessageBus};
pub use nats::NatsConnector;
pub use relay::{spawn_relay, Recorder, RecordingError, RecordingRelay, RelayStats, END_MARKER};
pub use retry::FlushRetry;
