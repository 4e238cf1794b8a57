//! Wiring for a complete ledger runtime.
//!
//! The guards are explicit components shared between the coordinator and
//! the admin surface, so a test can build as many isolated runtimes as it
//! needs.

use std::sync::Arc;
use tally_core::BalanceEngine;

use crate::admin::Admin;
use crate::auditor::ReconciliationAuditor;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, LedgerConfig};
use crate::coordinator::TransactionCoordinator;
use crate::resilience::{BackoffTracker, CircuitBreaker, Guard, RateLimiter};
use crate::store::LedgerStore;
use crate::telemetry::{TelemetrySink, TracingSink};

/// A configured ledger: coordinator, auditor, admin surface and guard.
#[derive(Clone)]
pub struct LedgerRuntime {
    pub coordinator: Arc<TransactionCoordinator>,
    pub auditor: Arc<ReconciliationAuditor>,
    pub admin: Admin,

    /// Circuit breaker and backoff for calls to external dependencies
    pub guard: Guard,

    config: LedgerConfig,
}

impl LedgerRuntime {
    pub fn builder() -> LedgerRuntimeBuilder {
        LedgerRuntimeBuilder::new()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

/// Builder for [`LedgerRuntime`].
pub struct LedgerRuntimeBuilder {
    config: LedgerConfig,
    store: Option<Arc<dyn LedgerStore>>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl LedgerRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: LedgerConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(TracingSink),
        }
    }

    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backing store. Required.
    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<LedgerRuntime, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingComponent("store"))?;
        let config = self.config;
        config.validate()?;

        let telemetry = self.telemetry;
        let limiter = Arc::new(
            RateLimiter::new(config.limiter.clone()).with_telemetry(Arc::clone(&telemetry)),
        );
        let breaker = Arc::new(
            CircuitBreaker::new(config.circuit_breaker.clone())
                .with_telemetry(Arc::clone(&telemetry)),
        );
        let backoff = Arc::new(
            BackoffTracker::new(config.backoff.clone()).with_telemetry(Arc::clone(&telemetry)),
        );

        let coordinator = TransactionCoordinator::new(Arc::clone(&store), &config)
            .with_limiter(Arc::clone(&limiter))
            .with_breaker(Arc::clone(&breaker))
            .with_backoff(Arc::clone(&backoff))
            .with_clock(Arc::clone(&self.clock))
            .with_telemetry(Arc::clone(&telemetry));

        let auditor = Arc::new(
            ReconciliationAuditor::new(Arc::clone(&store), BalanceEngine::new(config.plan))
                .with_clock(Arc::clone(&self.clock))
                .with_telemetry(Arc::clone(&telemetry))
                .with_concurrency(config.retention.reconcile_concurrency),
        );

        let admin = Admin {
            store,
            auditor: Arc::clone(&auditor),
            limiter,
            breaker: Arc::clone(&breaker),
            backoff: Arc::clone(&backoff),
            clock: self.clock,
            telemetry,
            retention: config.retention.clone(),
        };

        tracing::debug!(
            dedup_window = ?config.coordinator.dedup_window,
            write_timeout = ?config.coordinator.write_timeout,
            "Ledger runtime built"
        );

        Ok(LedgerRuntime {
            coordinator: Arc::new(coordinator),
            auditor,
            admin,
            guard: Guard::new(breaker, backoff),
            config,
        })
    }
}

impl Default for LedgerRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
