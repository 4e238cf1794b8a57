//! Circuit breaker to stop calling a known-failing dependency.
//!
//! Each named operation has its own circuit. State is evaluated lazily on
//! every check: a circuit whose most recent failure is older than the
//! cooldown is closed again, with no half-open probe state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration_str;
use crate::telemetry::{self, events, NullSink, TelemetryEvent, TelemetrySink};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,

    /// Quiet period after the last failure before the circuit closes
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Calls are rejected until the cooldown passes
    Open { last_failure: Instant },
}

#[derive(Debug, Clone, Copy)]
struct CircuitRecord {
    failures: u32,
    last_failure: Instant,
}

/// Per-operation circuit breaker.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitRecord>>,
    config: CircuitBreakerConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            telemetry: Arc::new(NullSink),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Check if the circuit for an operation is open.
    ///
    /// Returns true if calls should be rejected without reaching the
    /// downstream dependency.
    pub fn is_open(&self, operation: &str) -> bool {
        self.is_open_at(operation, Instant::now())
    }

    /// Record a successful call. Resets the failure count.
    pub fn record_success(&self, operation: &str) {
        let mut states = self.states.write();
        if states.remove(operation).is_some() {
            tracing::debug!(operation, "Circuit failure count reset after success");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, operation: &str) {
        self.record_failure_at(operation, Instant::now());
    }

    /// Get current state of a circuit.
    pub fn state(&self, operation: &str) -> CircuitState {
        let now = Instant::now();
        match self.states.read().get(operation) {
            Some(record) if !self.is_stale(record, now) => {
                if record.failures >= self.config.failure_threshold {
                    CircuitState::Open {
                        last_failure: record.last_failure,
                    }
                } else {
                    CircuitState::Closed {
                        failures: record.failures,
                    }
                }
            }
            _ => CircuitState::Closed { failures: 0 },
        }
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }

    fn is_stale(&self, record: &CircuitRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_failure) > self.config.cooldown
    }

    fn is_open_at(&self, operation: &str, now: Instant) -> bool {
        let states = self.states.read();
        let Some(record) = states.get(operation).copied() else {
            return false;
        };
        drop(states);

        if self.is_stale(&record, now) {
            let mut states = self.states.write();
            // Re-check under the write lock; a failure may have landed meanwhile
            let still_stale = states
                .get(operation)
                .is_some_and(|r| self.is_stale(r, now));
            if still_stale {
                states.remove(operation);
                drop(states);
                if record.failures >= self.config.failure_threshold {
                    tracing::info!(operation, "Circuit closed after cooldown");
                    telemetry::emit(
                        self.telemetry.as_ref(),
                        TelemetryEvent::new(events::CIRCUIT_CLOSED).param("operation", operation),
                    );
                }
                return false;
            }
            return states
                .get(operation)
                .is_some_and(|r| r.failures >= self.config.failure_threshold);
        }

        record.failures >= self.config.failure_threshold
    }

    fn record_failure_at(&self, operation: &str, now: Instant) {
        let mut states = self.states.write();
        let record = states
            .entry(operation.to_string())
            .or_insert(CircuitRecord {
                failures: 0,
                last_failure: now,
            });

        // Stale failures don't count toward the threshold
        if self.is_stale(record, now) {
            record.failures = 0;
        }
        record.failures += 1;
        record.last_failure = now;

        let failures = record.failures;
        drop(states);

        if failures == self.config.failure_threshold {
            tracing::warn!(operation, failures, "Circuit opened after repeated failures");
            telemetry::emit(
                self.telemetry.as_ref(),
                TelemetryEvent::new(events::CIRCUIT_OPENED)
                    .param("operation", operation)
                    .param("failures", failures),
            );
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(!cb.is_open("preview-fetch"));
        assert_eq!(cb.state("preview-fetch"), CircuitState::Closed { failures: 0 });
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let cb = breaker(2, 60);
        let t0 = Instant::now();

        cb.record_failure_at("preview-fetch", t0);
        assert!(!cb.is_open_at("preview-fetch", t0));

        cb.record_failure_at("preview-fetch", t0 + Duration::from_secs(1));
        assert!(cb.is_open_at("preview-fetch", t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::default();

        cb.record_failure("ingest-call");
        cb.record_failure("ingest-call");

        // Success should reset
        cb.record_success("ingest-call");

        // Need 3 more failures to open
        cb.record_failure("ingest-call");
        cb.record_failure("ingest-call");
        assert!(!cb.is_open("ingest-call"));
    }

    #[test]
    fn test_closes_after_cooldown() {
        let sink = Arc::new(MemorySink::new());
        let cb = breaker(2, 30).with_telemetry(sink.clone());
        let t0 = Instant::now();

        cb.record_failure_at("X", t0);
        cb.record_failure_at("X", t0);
        assert!(cb.is_open_at("X", t0 + Duration::from_secs(30)));
        assert!(!cb.is_open_at("X", t0 + Duration::from_secs(31)));

        assert_eq!(sink.count(events::CIRCUIT_OPENED), 1);
        assert_eq!(sink.count(events::CIRCUIT_CLOSED), 1);

        // Fresh attempt: one failure no longer opens it
        cb.record_failure_at("X", t0 + Duration::from_secs(32));
        assert!(!cb.is_open_at("X", t0 + Duration::from_secs(32)));
    }

    #[test]
    fn test_stale_failures_do_not_count() {
        let cb = breaker(2, 10);
        let t0 = Instant::now();

        cb.record_failure_at("X", t0);
        cb.record_failure_at("X", t0 + Duration::from_secs(11));
        assert!(!cb.is_open_at("X", t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_operations_are_independent() {
        let cb = breaker(2, 60);

        // Open preview circuit
        cb.record_failure("preview-fetch");
        cb.record_failure("preview-fetch");

        // Preview is open, but ingest is closed
        assert!(cb.is_open("preview-fetch"));
        assert!(!cb.is_open("ingest-call"));
        assert!(matches!(cb.state("preview-fetch"), CircuitState::Open { .. }));

        cb.reset();
        assert!(!cb.is_open("preview-fetch"));
    }
}
