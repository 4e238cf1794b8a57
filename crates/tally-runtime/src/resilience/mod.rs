//! Abuse-resilience guards for tally-runtime.
//!
//! This module provides:
//! - Sliding-window rate limiting per user, session and resource
//! - Circuit breaker per downstream operation
//! - Fixed-duration backoff per failing external resource
//! - A guard that applies the last two around a downstream call

mod backoff;
mod circuit_breaker;
mod guard;
mod rate_limiter;

pub use backoff::{BackoffActive, BackoffConfig, BackoffRecord, BackoffTracker};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use guard::{DownstreamFailure, Guard, GuardError};
pub use rate_limiter::{
    LimitScope, LimiterConfig, LimiterSweep, RateClass, RateLimitError, RateLimiter,
};

pub(crate) use rate_limiter::duration_millis;
