//! Guarded downstream calls.
//!
//! Combines the circuit breaker (keyed by operation) with the backoff
//! tracker (keyed by resource). A short-circuited call never polls the
//! downstream future.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use super::backoff::{BackoffActive, BackoffTracker};
use super::circuit_breaker::CircuitBreaker;
use crate::error::LedgerError;

/// Classifies downstream failures.
pub trait DownstreamFailure {
    /// True when the failure is tied to the resource itself (e.g. a video
    /// with no captions) rather than to the dependency's health.
    fn is_resource_failure(&self) -> bool {
        false
    }

    /// Short description recorded with the backoff.
    fn reason(&self) -> Option<String> {
        None
    }
}

/// Errors from a guarded call.
#[derive(Error, Debug)]
pub enum GuardError<E> {
    #[error("Service unavailable: circuit open for '{operation}'")]
    CircuitOpen { operation: String },

    #[error(transparent)]
    Backoff(BackoffActive),

    #[error("Downstream call failed: {0}")]
    Downstream(E),
}

impl<E> GuardError<E> {
    /// True when the downstream call was never attempted.
    pub fn is_short_circuit(&self) -> bool {
        !matches!(self, GuardError::Downstream(_))
    }

    /// Map guard rejections onto the ledger taxonomy, leaving downstream
    /// failures to the caller.
    pub fn into_ledger_error(self) -> Result<LedgerError, E> {
        match self {
            GuardError::CircuitOpen { operation } => {
                Ok(LedgerError::ServiceUnavailable { operation })
            }
            GuardError::Backoff(active) => Ok(active.into()),
            GuardError::Downstream(e) => Err(e),
        }
    }
}

/// Wraps downstream calls with the circuit breaker and backoff tracker.
#[derive(Clone)]
pub struct Guard {
    breaker: Arc<CircuitBreaker>,
    backoff: Arc<BackoffTracker>,
}

impl Guard {
    pub fn new(breaker: Arc<CircuitBreaker>, backoff: Arc<BackoffTracker>) -> Self {
        Self { breaker, backoff }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn backoff(&self) -> &Arc<BackoffTracker> {
        &self.backoff
    }

    /// Run `call` unless the operation's circuit is open or the resource
    /// is backing off, recording the outcome.
    pub async fn call<T, E, F>(
        &self,
        operation: &str,
        resource: Option<&str>,
        call: F,
    ) -> Result<T, GuardError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: DownstreamFailure,
    {
        if self.breaker.is_open(operation) {
            tracing::debug!(operation, "Circuit open, skipping downstream call");
            return Err(GuardError::CircuitOpen {
                operation: operation.to_string(),
            });
        }

        if let Some(resource_id) = resource {
            self.backoff.check(resource_id).map_err(GuardError::Backoff)?;
        }

        match call.await {
            Ok(value) => {
                self.breaker.record_success(operation);
                Ok(value)
            }
            Err(e) => {
                if let (Some(resource_id), true) = (resource, e.is_resource_failure()) {
                    // The dependency answered; only this resource is bad
                    self.backoff
                        .record_resource_failure(resource_id, e.reason().as_deref());
                } else {
                    self.breaker.record_failure(operation);
                }
                Err(GuardError::Downstream(e))
            }
        }
    }
}
