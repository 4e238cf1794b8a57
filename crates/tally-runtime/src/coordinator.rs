//! Transaction Coordinator.
//!
//! The only path that mutates balances. Every accepted request becomes
//! exactly one ledger entry and one account update, committed together.
//!
//! # Execution Flow
//! 1. Validate the request (no side effects on failure)
//! 2. Reject while the ledger-write circuit is open
//! 3. Reject requests naming a resource that is backing off
//! 4. Rate limit by source class, and by resource when one is named
//! 5. Dedup by request id within the dedup window
//! 6. Inside one store transaction, bounded by `write_timeout`:
//!    read account, check sufficiency, apply the engine, append, upsert, commit
//! 7. Report the outcome to telemetry

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use tally_core::{Account, Action, BalanceEngine, LedgerEntry, MetaValue, Metadata, Source};
use uuid::Uuid;

use crate::clock::{window_start, Clock, SystemClock};
use crate::config::{CoordinatorConfig, LedgerConfig};
use crate::error::LedgerError;
use crate::resilience::{BackoffTracker, CircuitBreaker, RateClass, RateLimiter};
use crate::store::LedgerStore;
use crate::telemetry::{self, events, TelemetryEvent, TelemetrySink, TracingSink};

/// Circuit breaker operation name for ledger writes.
pub const LEDGER_WRITE_OPERATION: &str = "ledger-write";

/// Metadata key naming the external resource a request touches.
pub const RESOURCE_ID_KEY: &str = "resource_id";

/// A caller's request to move tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub user_id: String,
    pub action: Action,
    pub tokens: u64,
    pub request_id: String,
    pub source: Source,
    pub metadata: Metadata,
}

impl TransactionRequest {
    pub fn new(
        user_id: impl Into<String>,
        action: Action,
        tokens: u64,
        request_id: impl Into<String>,
        source: Source,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action,
            tokens,
            request_id: request_id.into(),
            source,
            metadata: Metadata::new(),
        }
    }

    pub fn debit(
        user_id: impl Into<String>,
        tokens: u64,
        request_id: impl Into<String>,
        source: Source,
    ) -> Self {
        Self::new(user_id, Action::Debit, tokens, request_id, source)
    }

    pub fn credit(
        user_id: impl Into<String>,
        tokens: u64,
        request_id: impl Into<String>,
        source: Source,
    ) -> Self {
        Self::new(user_id, Action::Credit, tokens, request_id, source)
    }

    /// A billing rollover: plan defaults restored, monthly set to `tokens`.
    pub fn reset(user_id: impl Into<String>, tokens: u64, request_id: impl Into<String>) -> Self {
        Self::new(user_id, Action::Reset, tokens, request_id, Source::Rollover)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// The external resource this request targets, if any.
    pub fn resource_id(&self) -> Option<String> {
        self.metadata.get(RESOURCE_ID_KEY).map(ToString::to_string)
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::InvalidArgument("user_id must not be empty".to_string()));
        }
        if self.request_id.trim().is_empty() {
            return Err(LedgerError::InvalidArgument(
                "request_id must not be empty".to_string(),
            ));
        }
        if self.tokens == 0 {
            return Err(LedgerError::InvalidArgument(
                "tokens must be a positive integer".to_string(),
            ));
        }
        if i64::try_from(self.tokens).is_err() {
            return Err(LedgerError::InvalidArgument(format!(
                "tokens {} exceeds the maximum of {}",
                self.tokens,
                i64::MAX
            )));
        }
        Ok(())
    }
}

type RecentKey = (String, String);

/// Committed request ids, checked before opening a store transaction.
#[derive(Debug, Clone)]
struct RecentRequest {
    entry_id: String,
    timestamp: DateTime<Utc>,
}

/// Applies ledger transactions atomically.
pub struct TransactionCoordinator {
    store: Arc<dyn LedgerStore>,
    engine: BalanceEngine,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    backoff: Arc<BackoffTracker>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
    config: CoordinatorConfig,
    recent: Cache<RecentKey, RecentRequest>,
}

impl TransactionCoordinator {
    /// Create a coordinator with its own guards, built from `config`.
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            engine: BalanceEngine::new(config.plan),
            limiter: Arc::new(RateLimiter::new(config.limiter.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            backoff: Arc::new(BackoffTracker::new(config.backoff.clone())),
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(TracingSink),
            recent: Cache::builder()
                .max_capacity(config.coordinator.recent_request_capacity)
                .time_to_live(config.coordinator.dedup_window)
                .build(),
            config: config.coordinator.clone(),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<BackoffTracker>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn engine(&self) -> &BalanceEngine {
        &self.engine
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Apply one transaction and return the ledger entry it produced.
    ///
    /// `DuplicateRequest` means the request id was already applied inside
    /// the dedup window; treat it as success. `LedgerWriteFailed` is safe
    /// to retry with the same request id.
    pub async fn apply_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<LedgerEntry, LedgerError> {
        request.validate()?;

        if self.breaker.is_open(LEDGER_WRITE_OPERATION) {
            tracing::warn!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                "Ledger writes suspended, circuit open"
            );
            return Err(LedgerError::ServiceUnavailable {
                operation: LEDGER_WRITE_OPERATION.to_string(),
            });
        }

        if let Some(resource) = request.resource_id() {
            self.backoff.check(&resource)?;
        }
        self.check_rate(&request)?;

        if let Some(entry_id) = self.recent_duplicate(&request).await {
            return Err(self.duplicate(&request, entry_id));
        }

        let timeout = self.config.write_timeout;
        let outcome = match tokio::time::timeout(timeout, self.write(&request)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::LedgerWriteFailed(format!(
                "write did not complete within {timeout:?}"
            ))),
        };

        match outcome {
            Ok(entry) => {
                self.breaker.record_success(LEDGER_WRITE_OPERATION);
                self.recent
                    .insert(
                        (entry.user_id.clone(), entry.request_id.clone()),
                        RecentRequest {
                            entry_id: entry.entry_id.clone(),
                            timestamp: entry.timestamp,
                        },
                    )
                    .await;

                tracing::info!(
                    user_id = %entry.user_id,
                    entry_id = %entry.entry_id,
                    action = %entry.action,
                    tokens = entry.tokens,
                    source = %entry.source,
                    "Ledger entry written"
                );
                telemetry::emit(
                    self.telemetry.as_ref(),
                    TelemetryEvent::new(events::ENTRY_WRITTEN)
                        .param("user_id", entry.user_id.as_str())
                        .param("entry_id", entry.entry_id.as_str())
                        .param("action", entry.action.as_str())
                        .param("tokens", entry.tokens)
                        .param("source", entry.source.as_str()),
                );
                Ok(entry)
            }
            Err(LedgerError::DuplicateRequest { entry_id, .. }) => {
                Err(self.duplicate(&request, entry_id))
            }
            Err(LedgerError::LedgerWriteFailed(reason)) => {
                self.breaker.record_failure(LEDGER_WRITE_OPERATION);
                tracing::error!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    action = %request.action,
                    tokens = request.tokens,
                    error = %reason,
                    "Ledger write failed"
                );
                telemetry::emit(
                    self.telemetry.as_ref(),
                    TelemetryEvent::new(events::WRITE_ERROR)
                        .param("user_id", request.user_id.as_str())
                        .param("request_id", request.request_id.as_str())
                        .param("action", request.action.as_str())
                        .param("tokens", request.tokens)
                        .param("source", request.source.as_str())
                        .param("error", reason.as_str()),
                );
                Err(LedgerError::LedgerWriteFailed(reason))
            }
            Err(other) => {
                tracing::info!(
                    user_id = %request.user_id,
                    request_id = %request.request_id,
                    kind = other.kind(),
                    "Transaction rejected"
                );
                Err(other)
            }
        }
    }

    /// Whether the account currently covers a debit of `tokens`.
    pub async fn can_afford(&self, user_id: &str, tokens: u64) -> Result<bool, LedgerError> {
        let account = self.balance(user_id).await?;
        Ok(BalanceEngine::can_afford(&account.balances, tokens))
    }

    /// Current account projection, or plan defaults for an unknown user.
    /// Never writes.
    pub async fn balance(&self, user_id: &str) -> Result<Account, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::InvalidArgument("user_id must not be empty".to_string()));
        }
        let account = self
            .store
            .get_account(user_id)
            .await
            .map_err(LedgerError::read_failed)?;
        Ok(account.unwrap_or_else(|| Account::open(user_id, self.engine.plan(), self.clock.now())))
    }

    /// Most recent `limit` entries, oldest first.
    pub async fn history(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store
            .query_entries(user_id, None, limit)
            .await
            .map_err(LedgerError::read_failed)
    }

    fn check_rate(&self, request: &TransactionRequest) -> Result<(), LedgerError> {
        let Some(class) = RateClass::for_source(request.source) else {
            return Ok(());
        };

        let resource = request.resource_id();
        self.limiter
            .check_request(class, &request.user_id, resource.as_deref())
            .map_err(|e| {
                tracing::info!(
                    user_id = %request.user_id,
                    key = %e.key,
                    scope = %e.scope,
                    retry_after = ?e.retry_after,
                    "Request rate limited"
                );
                LedgerError::from(e)
            })
    }

    async fn recent_duplicate(&self, request: &TransactionRequest) -> Option<String> {
        let key = (request.user_id.clone(), request.request_id.clone());
        let recent = self.recent.get(&key).await?;
        let since = window_start(self.clock.now(), self.config.dedup_window);
        (recent.timestamp >= since).then_some(recent.entry_id)
    }

    fn duplicate(&self, request: &TransactionRequest, entry_id: String) -> LedgerError {
        tracing::info!(
            user_id = %request.user_id,
            request_id = %request.request_id,
            entry_id = %entry_id,
            "Duplicate request blocked"
        );
        telemetry::emit(
            self.telemetry.as_ref(),
            TelemetryEvent::new(events::DUPLICATE_REQUEST_BLOCKED)
                .param("user_id", request.user_id.as_str())
                .param("request_id", request.request_id.as_str())
                .param("entry_id", entry_id.as_str())
                .param("source", request.source.as_str()),
        );
        LedgerError::DuplicateRequest {
            request_id: request.request_id.clone(),
            entry_id,
        }
    }

    /// Dedup check plus atomic write. Any early return drops the
    /// transaction uncommitted.
    async fn write(&self, request: &TransactionRequest) -> Result<LedgerEntry, LedgerError> {
        let mut txn = self.store.begin(&request.user_id).await?;
        let now = self.clock.now();

        let since = window_start(now, self.config.dedup_window);
        let recent = txn.query_entries(Some(since), None).await?;
        if let Some(prior) = recent.into_iter().find(|e| e.request_id == request.request_id) {
            return Err(LedgerError::DuplicateRequest {
                request_id: request.request_id.clone(),
                entry_id: prior.entry_id,
            });
        }

        let account = match txn.get_account().await? {
            Some(account) => account,
            None => Account::open(&request.user_id, self.engine.plan(), now),
        };

        if request.action == Action::Debit
            && self.config.enforce_sufficiency
            && !BalanceEngine::can_afford(&account.balances, request.tokens)
        {
            return Err(LedgerError::InsufficientBalance {
                requested: request.tokens,
                available: account.total_available_tokens(),
            });
        }

        let balances = self
            .engine
            .apply(account.balances, request.action, request.tokens);

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7().to_string(),
            user_id: request.user_id.clone(),
            action: request.action,
            tokens: request.tokens,
            request_id: request.request_id.clone(),
            timestamp: now,
            source: request.source,
            metadata: request.metadata.clone(),
        };

        txn.append_entry(entry.clone()).await?;
        txn.upsert_account(Account {
            user_id: request.user_id.clone(),
            balances,
            last_ledger_entry_id: Some(entry.entry_id.clone()),
            last_updated: now,
        })
        .await?;
        txn.commit().await?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::LimitScope;
    use crate::store::MemoryStore;
    use crate::telemetry::MemorySink;
    use tally_core::Balances;

    struct Fixture {
        coordinator: TransactionCoordinator,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
    }

    fn fixture(config: LedgerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let sink = Arc::new(MemorySink::new());
        let coordinator = TransactionCoordinator::new(store.clone(), &config)
            .with_clock(clock.clone())
            .with_telemetry(sink.clone());
        Fixture {
            coordinator,
            store,
            clock,
            sink,
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_have_no_side_effects() {
        let f = fixture(LedgerConfig::default());

        for request in [
            TransactionRequest::debit("u1", 0, "r1", Source::Preview),
            TransactionRequest::debit("", 1, "r1", Source::Preview),
            TransactionRequest::debit("u1", 1, " ", Source::Preview),
            TransactionRequest::credit("u1", u64::MAX, "r1", Source::Purchase),
        ] {
            let err = f.coordinator.apply_transaction(request).await.unwrap_err();
            assert!(matches!(err, LedgerError::InvalidArgument(_)));
        }

        assert!(f.store.get_account("u1").await.unwrap().is_none());
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_debit_drains_in_order_and_links_account() {
        let f = fixture(LedgerConfig::default());
        let entry = f
            .coordinator
            .apply_transaction(TransactionRequest::debit("u1", 25, "req-1", Source::Preview))
            .await
            .unwrap();

        let account = f.store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.balances, Balances::new(0, 15, 0));
        assert_eq!(account.last_ledger_entry_id.as_deref(), Some(entry.entry_id.as_str()));
        assert_eq!(account.last_updated, f.clock.now());

        let written = f.sink.last(events::ENTRY_WRITTEN).unwrap();
        assert_eq!(written.get("tokens"), Some(&MetaValue::Int(25)));
        assert_eq!(written.get("source"), Some(&MetaValue::from("preview")));
    }

    #[tokio::test]
    async fn test_duplicate_within_window_then_allowed_after() {
        let f = fixture(LedgerConfig::default());
        let request = TransactionRequest::credit("u1", 10, "req-1", Source::Purchase);

        let first = f.coordinator.apply_transaction(request.clone()).await.unwrap();
        let err = f.coordinator.apply_transaction(request.clone()).await.unwrap_err();
        match err {
            LedgerError::DuplicateRequest { entry_id, .. } => assert_eq!(entry_id, first.entry_id),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(f.sink.count(events::DUPLICATE_REQUEST_BLOCKED), 1);

        f.clock.advance(chrono::Duration::seconds(61));
        f.coordinator.apply_transaction(request).await.unwrap();

        let entries = f.store.query_entries("u1", None, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(f.store.get_account("u1").await.unwrap().unwrap().balances.monthly_tokens, 20);
    }

    #[tokio::test]
    async fn test_store_dedup_catches_cache_miss() {
        let f = fixture(LedgerConfig::default());
        let request = TransactionRequest::credit("u1", 10, "req-1", Source::Purchase);
        f.coordinator.apply_transaction(request.clone()).await.unwrap();

        // A second coordinator over the same store has a cold cache
        let other = TransactionCoordinator::new(f.store.clone(), &LedgerConfig::default())
            .with_clock(f.clock.clone());
        let err = other.apply_transaction(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateRequest { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected_without_write() {
        let f = fixture(LedgerConfig::default());
        let err = f
            .coordinator
            .apply_transaction(TransactionRequest::debit("u1", 41, "r1", Source::Generation))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                requested: 41,
                available: 40
            }
        ));
        assert!(f.store.query_entries("u1", None, None).await.unwrap().is_empty());
        assert!(!f.coordinator.breaker().is_open(LEDGER_WRITE_OPERATION));
    }

    #[tokio::test]
    async fn test_sufficiency_can_be_disabled() {
        let mut config = LedgerConfig::default();
        config.coordinator.enforce_sufficiency = false;
        let f = fixture(config);

        f.coordinator
            .apply_transaction(TransactionRequest::debit("u1", 45, "r1", Source::Generation))
            .await
            .unwrap();
        let account = f.coordinator.balance("u1").await.unwrap();
        assert_eq!(account.balances, Balances::new(0, 0, -5));
    }

    #[tokio::test]
    async fn test_reset_restores_plan_and_sets_monthly() {
        let f = fixture(LedgerConfig::default());
        f.coordinator
            .apply_transaction(TransactionRequest::debit("u1", 30, "r1", Source::Preview))
            .await
            .unwrap();
        f.coordinator
            .apply_transaction(TransactionRequest::reset("u1", 500, "rollover-2026-10"))
            .await
            .unwrap();

        let account = f.coordinator.balance("u1").await.unwrap();
        assert_eq!(account.balances, Balances::new(20, 20, 500));
    }

    #[tokio::test]
    async fn test_grants_are_not_rate_limited() {
        let mut config = LedgerConfig::default();
        config.limiter.preview_per_minute = 1;
        let f = fixture(config);

        for i in 0..5 {
            f.coordinator
                .apply_transaction(TransactionRequest::credit(
                    "u1",
                    1,
                    format!("grant-{i}"),
                    Source::Purchase,
                ))
                .await
                .unwrap();
        }

        f.coordinator
            .apply_transaction(TransactionRequest::debit("u1", 1, "p1", Source::Preview))
            .await
            .unwrap();
        let err = f
            .coordinator
            .apply_transaction(TransactionRequest::debit("u1", 1, "p2", Source::Preview))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RateLimited { .. }));
        assert!(err.is_routine());
    }

    #[tokio::test]
    async fn test_resource_limit_applies_across_users() {
        let mut config = LedgerConfig::default();
        config.limiter.resource_per_hour = 2;
        let f = fixture(config);

        for (i, user) in ["a", "b", "c"].iter().enumerate() {
            let result = f
                .coordinator
                .apply_transaction(
                    TransactionRequest::debit(*user, 1, format!("r{i}"), Source::Preview)
                        .with_metadata(RESOURCE_ID_KEY, "vid-42"),
                )
                .await;
            if i < 2 {
                result.unwrap();
            } else {
                assert!(matches!(result, Err(LedgerError::RateLimited { .. })));
            }
        }
        assert!(f.coordinator.limiter().is_resource_flagged("vid-42"));
    }

    #[tokio::test]
    async fn test_flagged_resource_does_not_spend_user_quota() {
        let mut config = LedgerConfig::default();
        config.limiter.resource_per_hour = 1;
        config.limiter.preview_per_minute = 2;
        let f = fixture(config);
        let on_video = |user: &str, id: &str| {
            TransactionRequest::debit(user, 1, id, Source::Preview)
                .with_metadata(RESOURCE_ID_KEY, "vid-1")
        };

        f.coordinator.apply_transaction(on_video("other", "o1")).await.unwrap();
        for id in ["a1", "a2"] {
            let err = f.coordinator.apply_transaction(on_video("u1", id)).await.unwrap_err();
            assert!(matches!(err, LedgerError::RateLimited { scope: LimitScope::Resource, .. }));
        }

        for id in ["p1", "p2"] {
            f.coordinator
                .apply_transaction(TransactionRequest::debit("u1", 1, id, Source::Preview))
                .await
                .unwrap();
        }
        assert_eq!(f.store.query_entries("u1", None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_before_store() {
        let f = fixture(LedgerConfig::default());
        for _ in 0..3 {
            f.coordinator.breaker().record_failure(LEDGER_WRITE_OPERATION);
        }

        let err = f
            .coordinator
            .apply_transaction(TransactionRequest::credit("u1", 5, "r1", Source::Purchase))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ServiceUnavailable { .. }));
        assert!(f.store.get_account("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backed_off_resource_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        let backoff = Arc::new(BackoffTracker::default());
        let coordinator = TransactionCoordinator::new(store.clone(), &LedgerConfig::default())
            .with_backoff(backoff.clone());

        backoff.record_resource_failure("vid-7", Some("no captions"));
        let request = TransactionRequest::debit("u1", 1, "r1", Source::Ingest)
            .with_metadata(RESOURCE_ID_KEY, "vid-7");

        let err = coordinator.apply_transaction(request.clone()).await.unwrap_err();
        assert!(matches!(err, LedgerError::TemporarilyUnavailable { .. }));
        assert!(err.is_routine());
        assert!(store.get_account("u1").await.unwrap().is_none());

        // The rejection consumed no ingest quota
        backoff.clear("vid-7");
        coordinator.apply_transaction(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_balance_and_can_afford_for_unknown_user() {
        let f = fixture(LedgerConfig::default());
        let account = f.coordinator.balance("ghost").await.unwrap();
        assert_eq!(account.total_available_tokens(), 40);
        assert!(account.last_ledger_entry_id.is_none());
        assert!(f.coordinator.can_afford("ghost", 40).await.unwrap());
        assert!(!f.coordinator.can_afford("ghost", 41).await.unwrap());

        // Read-only: nothing was persisted
        assert!(f.store.get_account("ghost").await.unwrap().is_none());
    }
}
