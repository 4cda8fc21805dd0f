//! OpenTelemetry counters
//!
//! Instruments come from the global meter; without an installed provider they
//! are no-ops.

use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::role::Role;

fn counter(
    cell: &'static OnceLock<Counter<u64>>,
    name: &'static str,
    description: &'static str,
) -> Counter<u64> {
    cell.get_or_init(|| {
        opentelemetry::global::meter("termgate")
            .u64_counter(name)
            .with_description(description)
            .build()
    })
    .clone()
}

pub fn record_connection_accepted() {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    counter(
        &COUNTER,
        "termgate.connections.accepted",
        "Connections accepted by the supervisor",
    )
    .add(1, &[]);
}

pub fn record_role(role: Role) {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    counter(
        &COUNTER,
        "termgate.roles.negotiated",
        "Connections that reached a fixed role",
    )
    .add(1, &[KeyValue::new("role", role.as_str())]);
}

pub fn record_bytes(len: usize) {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    counter(
        &COUNTER,
        "termgate.recording.bytes",
        "Session bytes published to the recording bus",
    )
    .add(len as u64, &[]);
}

pub fn record_flush_retry() {
    static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
    counter(
        &COUNTER,
        "termgate.recording.flush_retries",
        "Failed end-of-session flush attempts",
    )
    .add(1, &[]);
}
