//! Telemetry sinks.
//!
//! Every component reports state changes as named events with a small
//! key/value parameter map. A sink that fails never fails the operation
//! that produced the event.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tally_core::{MetaValue, Metadata};
use thiserror::Error;

/// Well-known event names.
pub mod events {
    pub const ENTRY_WRITTEN: &str = "ledger.entry_written";
    pub const WRITE_ERROR: &str = "ledger.write_error";
    pub const RECONCILE_OK: &str = "ledger.reconcile_ok";
    pub const RECONCILE_MISMATCH: &str = "ledger.reconcile_mismatch";
    pub const RETENTION_CLEANUP: &str = "ledger.retention_cleanup";
    pub const DUPLICATE_REQUEST_BLOCKED: &str = "abuse.duplicate_request_blocked";
    pub const RATE_LIMITED: &str = "abuse.rate_limited";
    pub const RESOURCE_FLAGGED: &str = "abuse.resource_flagged";
    pub const CIRCUIT_OPENED: &str = "resilience.circuit_opened";
    pub const CIRCUIT_CLOSED: &str = "resilience.circuit_closed";
    pub const BACKOFF_STARTED: &str = "resilience.backoff_started";
    pub const BACKOFF_CLEARED: &str = "resilience.backoff_cleared";
}

/// Errors a sink may report.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode telemetry event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A named telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub name: &'static str,
    pub params: Metadata,
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            params: Metadata::new(),
            at: Utc::now(),
        }
    }

    /// Builder-style parameter.
    pub fn param(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.params.get(key)
    }
}

/// Destination for telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Emit an event, swallowing sink failures.
pub(crate) fn emit(sink: &dyn TelemetrySink, event: TelemetryEvent) {
    if let Err(e) = sink.emit(&event) {
        tracing::debug!(event = event.name, error = %e, "Telemetry sink rejected event");
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let params = serde_json::to_string(&event.params)?;
        match event.name {
            events::WRITE_ERROR => {
                tracing::error!(target: "tally::telemetry", event = event.name, %params)
            }
            events::RECONCILE_MISMATCH | events::RESOURCE_FLAGGED | events::CIRCUIT_OPENED => {
                tracing::warn!(target: "tally::telemetry", event = event.name, %params)
            }
            _ => tracing::info!(target: "tally::telemetry", event = event.name, %params),
        }
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }

    pub fn last(&self, name: &str) -> Option<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.name == name)
            .cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    impl TelemetrySink for BrokenSink {
        fn emit(&self, _event: &TelemetryEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError::Unavailable("collector down".to_string()))
        }
    }

    #[test]
    fn test_memory_sink_counts_by_name() {
        let sink = MemorySink::new();
        emit(&sink, TelemetryEvent::new(events::ENTRY_WRITTEN).param("tokens", 5i64));
        emit(&sink, TelemetryEvent::new(events::ENTRY_WRITTEN));
        emit(&sink, TelemetryEvent::new(events::WRITE_ERROR));

        assert_eq!(sink.count(events::ENTRY_WRITTEN), 2);
        assert_eq!(sink.count(events::WRITE_ERROR), 1);
        assert_eq!(
            sink.events()[0].get("tokens"),
            Some(&MetaValue::Int(5))
        );
    }

    #[test]
    fn test_broken_sink_is_swallowed() {
        // Must not panic or propagate
        emit(&BrokenSink, TelemetryEvent::new(events::RECONCILE_OK));
    }

    #[test]
    fn test_tracing_sink_accepts_all_events() {
        let sink = TracingSink;
        assert!(sink.emit(&TelemetryEvent::new(events::WRITE_ERROR)).is_ok());
        assert!(sink.emit(&TelemetryEvent::new(events::CIRCUIT_OPENED)).is_ok());
        assert!(sink.emit(&TelemetryEvent::new(events::BACKOFF_CLEARED)).is_ok());
    }
}
