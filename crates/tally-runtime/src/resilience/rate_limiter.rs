//! Sliding-window rate limiting per user, per session and per resource.
//!
//! All checks are check-then-record: a rejected request never consumes
//! quota, and nothing here sleeps or queues. Callers own backoff and
//! user messaging.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tally_core::Source;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::duration_str;
use crate::telemetry::{self, events, NullSink, TelemetryEvent, TelemetrySink};

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Preview-class requests allowed per short window
    pub preview_per_minute: u32,

    /// Preview-class requests allowed per long window
    pub preview_per_hour: u32,

    /// Minimum spacing between ingest-class requests of one user
    #[serde(with = "duration_str")]
    pub ingest_min_interval: Duration,

    /// Length of a rolling session, measured from its first request
    #[serde(with = "duration_str")]
    pub session_length: Duration,

    /// Requests allowed in one session regardless of window limits
    pub session_max_requests: u32,

    /// Requests for a single external resource per long window, all users
    pub resource_per_hour: u32,

    #[serde(with = "duration_str")]
    pub short_window: Duration,

    /// Longest tracked window; user history is trimmed to this
    #[serde(with = "duration_str")]
    pub long_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            preview_per_minute: 10,
            preview_per_hour: 60,
            ingest_min_interval: Duration::from_secs(120),
            session_length: Duration::from_secs(3600),
            session_max_requests: 120,
            resource_per_hour: 20,
            short_window: Duration::from_secs(60),
            long_window: Duration::from_secs(3600),
        }
    }
}

/// Which limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    PerMinute,
    PerHour,
    IngestInterval,
    Session,
    Resource,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::PerMinute => "per_minute",
            LimitScope::PerHour => "per_hour",
            LimitScope::IngestInterval => "ingest_interval",
            LimitScope::Session => "session",
            LimitScope::Resource => "resource",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{scope} limit of {limit} exceeded for '{key}', retry after {retry_after:?}")]
pub struct RateLimitError {
    pub scope: LimitScope,
    pub key: String,
    pub limit: u32,
    pub retry_after: Duration,
}

/// Operation class a ledger source is throttled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    Preview,
    Ingest,
}

impl RateClass {
    /// Grants (purchases, subscriptions, rollovers, admin) are not throttled.
    pub fn for_source(source: Source) -> Option<RateClass> {
        match source {
            Source::Preview | Source::Generation => Some(RateClass::Preview),
            Source::Ingest => Some(RateClass::Ingest),
            Source::Purchase | Source::Subscription | Source::Rollover | Source::Admin => None,
        }
    }
}

#[derive(Debug)]
struct Session {
    started: Instant,
    count: u32,
}

#[derive(Debug, Default)]
struct UserState {
    /// Accepted request times, oldest first
    history: VecDeque<Instant>,
    last_ingest: Option<Instant>,
    session: Option<Session>,
}

#[derive(Debug)]
struct ResourceState {
    window_start: Instant,
    count: u32,
    flagged: bool,
}

impl ResourceState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            flagged: false,
        }
    }
}

struct ResourceRejection {
    newly_flagged: bool,
    error: RateLimitError,
}

#[derive(Debug, Default)]
struct LimiterState {
    users: HashMap<String, UserState>,
    resources: HashMap<String, ResourceState>,
}

/// Counts removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterSweep {
    pub users_dropped: usize,
    pub resources_cleared: usize,
}

/// Per-user and per-resource rate limiter.
///
/// Safe for concurrent callers; every check holds one short lock.
pub struct RateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
            telemetry: Arc::new(NullSink),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Check a request of the given class and record it if allowed.
    pub fn check(&self, class: RateClass, user_id: &str) -> Result<(), RateLimitError> {
        self.check_request(class, user_id, None)
    }

    /// Check a user request that also names an external resource.
    ///
    /// The user and resource limits are evaluated together; a request
    /// rejected by either one is recorded against neither.
    pub fn check_request(
        &self,
        class: RateClass,
        user_id: &str,
        resource_id: Option<&str>,
    ) -> Result<(), RateLimitError> {
        self.check_request_at(user_id, class, resource_id, Instant::now())
    }

    pub fn check_and_consume_preview(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.check_user_at(user_id, RateClass::Preview, Instant::now())
    }

    pub fn check_and_consume_ingest(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.check_user_at(user_id, RateClass::Ingest, Instant::now())
    }

    /// Count a request against an external resource across all users.
    pub fn check_video(&self, resource_id: &str) -> Result<(), RateLimitError> {
        self.check_resource_at(resource_id, Instant::now())
    }

    /// Forget everything tracked for a user.
    pub fn reset_user(&self, user_id: &str) -> bool {
        self.state.lock().users.remove(user_id).is_some()
    }

    /// Whether a resource is currently flagged as suspicious.
    pub fn is_resource_flagged(&self, resource_id: &str) -> bool {
        self.state
            .lock()
            .resources
            .get(resource_id)
            .is_some_and(|r| r.flagged)
    }

    /// Drop expired history, sessions and resource windows.
    pub fn sweep(&self) -> LimiterSweep {
        self.sweep_at(Instant::now())
    }

    fn check_user_at(
        &self,
        user_id: &str,
        class: RateClass,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        self.check_request_at(user_id, class, None, now)
    }

    /// Evaluate every limit under one lock, then record the request against
    /// the user and the resource only if all of them pass.
    fn check_request_at(
        &self,
        user_id: &str,
        class: RateClass,
        resource_id: Option<&str>,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let cfg = &self.config;
        let mut state = self.state.lock();
        let LimiterState { users, resources } = &mut *state;
        let user = users.entry(user_id.to_string()).or_default();
        prune_history(&mut user.history, now, cfg.long_window);

        if let Err(e) = Self::evaluate_user(cfg, user_id, user, class, now) {
            drop(state);
            self.report_user_limited(user_id, &e);
            return Err(e);
        }

        if let Some(resource_id) = resource_id {
            let resource = resources
                .entry(resource_id.to_string())
                .or_insert_with(|| ResourceState::new(now));
            if let Err(rejection) = Self::evaluate_resource(cfg, resource_id, resource, now) {
                drop(state);
                self.report_resource_limited(resource_id, &rejection);
                return Err(rejection.error);
            }
            resource.count += 1;
        }

        Self::record_user(cfg, user, class, now);
        Ok(())
    }

    fn evaluate_user(
        cfg: &LimiterConfig,
        user_id: &str,
        user: &UserState,
        class: RateClass,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let reject = |scope, limit, retry_after| RateLimitError {
            scope,
            key: user_id.to_string(),
            limit,
            retry_after,
        };

        if class == RateClass::Ingest {
            if let Some(last) = user.last_ingest {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < cfg.ingest_min_interval {
                    return Err(reject(
                        LimitScope::IngestInterval,
                        1,
                        cfg.ingest_min_interval - elapsed,
                    ));
                }
            }
        }

        let windows = [
            (LimitScope::PerMinute, cfg.short_window, cfg.preview_per_minute),
            (LimitScope::PerHour, cfg.long_window, cfg.preview_per_hour),
        ];
        for (scope, window, limit) in windows {
            let (count, oldest) = window_usage(&user.history, now, window);
            if count >= limit as usize {
                let retry_after = oldest
                    .map(|t| window.saturating_sub(now.saturating_duration_since(t)))
                    .unwrap_or(window);
                return Err(reject(scope, limit, retry_after));
            }
        }

        if let Some(session) = &user.session {
            let elapsed = now.saturating_duration_since(session.started);
            if elapsed < cfg.session_length && session.count >= cfg.session_max_requests {
                return Err(reject(
                    LimitScope::Session,
                    cfg.session_max_requests,
                    cfg.session_length - elapsed,
                ));
            }
        }

        Ok(())
    }

    fn record_user(cfg: &LimiterConfig, user: &mut UserState, class: RateClass, now: Instant) {
        user.history.push_back(now);
        if class == RateClass::Ingest {
            user.last_ingest = Some(now);
        }
        match user.session.as_mut() {
            Some(session) if now.duration_since(session.started) < cfg.session_length => {
                session.count += 1;
            }
            _ => {
                user.session = Some(Session {
                    started: now,
                    count: 1,
                });
            }
        }
    }

    /// Rolls the resource window over when it has elapsed. Flags the
    /// resource on its first rejection; a flag holds until swept.
    fn evaluate_resource(
        cfg: &LimiterConfig,
        resource_id: &str,
        resource: &mut ResourceState,
        now: Instant,
    ) -> Result<(), ResourceRejection> {
        let elapsed = now.saturating_duration_since(resource.window_start);
        if !resource.flagged && elapsed >= cfg.long_window {
            resource.window_start = now;
            resource.count = 0;
        }

        if resource.flagged || resource.count >= cfg.resource_per_hour {
            let newly_flagged = !resource.flagged;
            resource.flagged = true;
            return Err(ResourceRejection {
                newly_flagged,
                error: RateLimitError {
                    scope: LimitScope::Resource,
                    key: resource_id.to_string(),
                    limit: cfg.resource_per_hour,
                    retry_after: cfg
                        .long_window
                        .saturating_sub(now.saturating_duration_since(resource.window_start)),
                },
            });
        }
        Ok(())
    }

    fn check_resource_at(&self, resource_id: &str, now: Instant) -> Result<(), RateLimitError> {
        let mut state = self.state.lock();
        let resource = state
            .resources
            .entry(resource_id.to_string())
            .or_insert_with(|| ResourceState::new(now));

        match Self::evaluate_resource(&self.config, resource_id, resource, now) {
            Ok(()) => {
                resource.count += 1;
                Ok(())
            }
            Err(rejection) => {
                drop(state);
                self.report_resource_limited(resource_id, &rejection);
                Err(rejection.error)
            }
        }
    }

    fn report_user_limited(&self, user_id: &str, e: &RateLimitError) {
        tracing::debug!(user_id, scope = %e.scope, retry_after = ?e.retry_after, "Request rate limited");
        telemetry::emit(
            self.telemetry.as_ref(),
            TelemetryEvent::new(events::RATE_LIMITED)
                .param("user_id", user_id)
                .param("scope", e.scope.as_str())
                .param("retry_after_ms", duration_millis(e.retry_after)),
        );
    }

    fn report_resource_limited(&self, resource_id: &str, rejection: &ResourceRejection) {
        if !rejection.newly_flagged {
            return;
        }
        let limit = self.config.resource_per_hour;
        tracing::warn!(resource_id, limit, "Resource flagged as suspicious");
        telemetry::emit(
            self.telemetry.as_ref(),
            TelemetryEvent::new(events::RESOURCE_FLAGGED)
                .param("resource_id", resource_id)
                .param("limit", limit),
        );
    }

    fn sweep_at(&self, now: Instant) -> LimiterSweep {
        let cfg = &self.config;
        let mut state = self.state.lock();

        let users_before = state.users.len();
        state.users.retain(|_, user| {
            prune_history(&mut user.history, now, cfg.long_window);
            if user
                .session
                .as_ref()
                .is_some_and(|s| now.saturating_duration_since(s.started) >= cfg.session_length)
            {
                user.session = None;
            }
            if user
                .last_ingest
                .is_some_and(|t| now.saturating_duration_since(t) >= cfg.ingest_min_interval)
            {
                user.last_ingest = None;
            }
            !user.history.is_empty() || user.session.is_some() || user.last_ingest.is_some()
        });

        let resources_before = state.resources.len();
        state
            .resources
            .retain(|_, r| now.saturating_duration_since(r.window_start) < cfg.long_window);

        LimiterSweep {
            users_dropped: users_before - state.users.len(),
            resources_cleared: resources_before - state.resources.len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

fn prune_history(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while history
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        history.pop_front();
    }
}

/// Requests inside `window` and the oldest of them.
fn window_usage(
    history: &VecDeque<Instant>,
    now: Instant,
    window: Duration,
) -> (usize, Option<Instant>) {
    let start = history.partition_point(|t| now.saturating_duration_since(*t) >= window);
    (history.len() - start, history.get(start).copied())
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
