//! Per-resource backoff.
//!
//! Keyed by external resource id (a video, a document), not by operation.
//! A resource that fails structurally (no captions, private upload) is put
//! on a fixed cooldown so callers stop hammering the dependency with it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::duration_str;
use crate::resilience::rate_limiter::duration_millis;
use crate::telemetry::{self, events, NullSink, TelemetryEvent, TelemetrySink};

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Fixed cooldown applied after each failure
    #[serde(with = "duration_str")]
    pub duration: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3600),
        }
    }
}

/// Backoff state for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffRecord {
    pub failure_count: u32,
    pub last_failure: Instant,
    pub backoff_until: Instant,
    pub reason: Option<String>,
}

/// A request short-circuited by an active backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource '{resource}' is backing off after {failures} failure(s), retry after {retry_after:?}")]
pub struct BackoffActive {
    pub resource: String,
    pub failures: u32,
    pub reason: Option<String>,
    pub retry_after: Duration,
}

/// Tracks failing external resources.
pub struct BackoffTracker {
    records: RwLock<HashMap<String, BackoffRecord>>,
    config: BackoffConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl BackoffTracker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            config,
            telemetry: Arc::new(NullSink),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Record a failure and (re)start the cooldown.
    pub fn record_resource_failure(&self, resource_id: &str, reason: Option<&str>) {
        self.record_failure_at(resource_id, reason, Instant::now());
    }

    pub fn is_backoff_active(&self, resource_id: &str) -> bool {
        self.is_active_at(resource_id, Instant::now())
    }

    /// Fail fast if the resource is backing off.
    pub fn check(&self, resource_id: &str) -> Result<(), BackoffActive> {
        self.check_at(resource_id, Instant::now())
    }

    /// Drop the record for a resource. Returns whether one existed.
    pub fn clear(&self, resource_id: &str) -> bool {
        let removed = self.records.write().remove(resource_id).is_some();
        if removed {
            tracing::info!(resource_id, "Resource backoff cleared");
            telemetry::emit(
                self.telemetry.as_ref(),
                TelemetryEvent::new(events::BACKOFF_CLEARED).param("resource_id", resource_id),
            );
        }
        removed
    }

    pub fn snapshot(&self, resource_id: &str) -> Option<BackoffRecord> {
        self.records.read().get(resource_id).cloned()
    }

    /// Remove records whose cooldown has passed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn record_failure_at(&self, resource_id: &str, reason: Option<&str>, now: Instant) {
        let backoff_until = now + self.config.duration;
        let failures = {
            let mut records = self.records.write();
            let record = records
                .entry(resource_id.to_string())
                .or_insert(BackoffRecord {
                    failure_count: 0,
                    last_failure: now,
                    backoff_until,
                    reason: None,
                });
            record.failure_count += 1;
            record.last_failure = now;
            record.backoff_until = backoff_until;
            if let Some(reason) = reason {
                record.reason = Some(reason.to_string());
            }
            record.failure_count
        };

        tracing::warn!(
            resource_id,
            failures,
            reason = reason.unwrap_or("unspecified"),
            backoff = ?self.config.duration,
            "Resource backoff started"
        );
        let mut event = TelemetryEvent::new(events::BACKOFF_STARTED)
            .param("resource_id", resource_id)
            .param("failures", failures)
            .param("backoff_ms", duration_millis(self.config.duration));
        if let Some(reason) = reason {
            event = event.param("reason", reason);
        }
        telemetry::emit(self.telemetry.as_ref(), event);
    }

    fn is_active_at(&self, resource_id: &str, now: Instant) -> bool {
        self.records
            .read()
            .get(resource_id)
            .is_some_and(|r| now < r.backoff_until)
    }

    fn check_at(&self, resource_id: &str, now: Instant) -> Result<(), BackoffActive> {
        match self.records.read().get(resource_id) {
            Some(record) if now < record.backoff_until => Err(BackoffActive {
                resource: resource_id.to_string(),
                failures: record.failure_count,
                reason: record.reason.clone(),
                retry_after: record.backoff_until - now,
            }),
            _ => Ok(()),
        }
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| now < r.backoff_until);
        before - records.len()
    }
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
