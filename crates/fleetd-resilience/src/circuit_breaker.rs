//! Closed/Open/HalfOpen circuit breaker with per-key breaker groups.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetd_errors::{Error, ErrorCode};
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning. `should_trip` decides which failures count toward the
/// trip threshold; `on_state_change` is an optional observability hook.
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub max_requests_in_half_open: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub should_trip: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
    pub on_state_change: Option<Arc<dyn Fn(CircuitBreakerState, CircuitBreakerState) + Send + Sync>>,
}

impl Clone for CircuitBreakerConfig {
    fn clone(&self) -> Self {
        Self {
            max_failures: self.max_failures,
            max_requests_in_half_open: self.max_requests_in_half_open,
            interval: self.interval,
            timeout: self.timeout,
            should_trip: Arc::clone(&self.should_trip),
            on_state_change: self.on_state_change.clone(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            max_requests_in_half_open: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            should_trip: Arc::new(|_| true),
            on_state_change: None,
        }
    }
}

struct Inner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    interval_started_at: Duration,
    opened_at: Duration,
    half_open_admitted: u32,
}

/// A single named breaker. State transitions are serialized by an async
/// mutex; the failure counter underneath is an atomic for cheap reads.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    failure_count: AtomicU32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: &dyn Clock) -> Self {
        let now = clock.now();
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                interval_started_at: now,
                opened_at: Duration::ZERO,
                half_open_admitted: 0,
            }),
            failure_count: AtomicU32::new(0),
        }
    }

    pub async fn state(&self, clock: &dyn Clock) -> CircuitBreakerState {
        let mut guard = self.inner.lock().await;
        self.advance_state(&mut guard, clock.now());
        guard.state
    }

    fn advance_state(&self, inner: &mut Inner, now: Duration) {
        match inner.state {
            CircuitBreakerState::Closed => {
                if now.saturating_sub(inner.interval_started_at) >= self.config.interval {
                    inner.consecutive_failures = 0;
                    self.failure_count.store(0, Ordering::SeqCst);
                    inner.interval_started_at = now;
                }
            }
            CircuitBreakerState::Open => {
                if now >= inner.opened_at + self.config.timeout {
                    self.transition(inner, CircuitBreakerState::HalfOpen);
                    inner.half_open_admitted = 0;
                }
            }
            CircuitBreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if let Some(hook) = &self.config.on_state_change {
            hook(from, to);
        }
    }

    /// Run `op` guarded by the breaker. Rejects immediately with
    /// `unavailable` when Open; admits bounded trial calls when HalfOpen.
    pub async fn execute<T, F, Fut>(&self, clock: &dyn Clock, op: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let now = clock.now();
        {
            let mut guard = self.inner.lock().await;
            self.advance_state(&mut guard, now);

            match guard.state {
                CircuitBreakerState::Open => {
                    let retry_after = (guard.opened_at + self.config.timeout).saturating_sub(now);
                    return Err(Error::new(ErrorCode::Unavailable, "circuit breaker is open")
                        .with_retry_after(retry_after));
                }
                CircuitBreakerState::HalfOpen => {
                    if guard.half_open_admitted >= self.config.max_requests_in_half_open {
                        let retry_after = self.config.timeout;
                        return Err(Error::new(ErrorCode::Unavailable, "circuit breaker half-open request budget exhausted")
                            .with_retry_after(retry_after));
                    }
                    guard.half_open_admitted += 1;
                }
                CircuitBreakerState::Closed => {}
            }
        }

        match op().await {
            Ok(value) => {
                self.record_success(clock).await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err, clock).await;
                Err(err)
            }
        }
    }

    /// Like [`Self::execute`], but calls `fallback` instead of rejecting when
    /// the breaker is Open.
    pub async fn execute_with_fallback<T, F, Fut, Fb, FbFut>(&self, clock: &dyn Clock, op: F, fallback: Fb) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, Error>>,
    {
        if self.state(clock).await == CircuitBreakerState::Open {
            return fallback().await;
        }
        self.execute(clock, op).await
    }

    async fn record_success(&self, clock: &dyn Clock) {
        let mut guard = self.inner.lock().await;
        self.advance_state(&mut guard, clock.now());
        guard.consecutive_failures = 0;
        self.failure_count.store(0, Ordering::SeqCst);
        if guard.state == CircuitBreakerState::HalfOpen {
            self.transition(&mut guard, CircuitBreakerState::Closed);
            guard.interval_started_at = clock.now();
        }
    }

    async fn record_failure(&self, err: &Error, clock: &dyn Clock) {
        let trips = (self.config.should_trip)(err);
        let mut guard = self.inner.lock().await;
        let now = clock.now();
        self.advance_state(&mut guard, now);

        if guard.state == CircuitBreakerState::HalfOpen {
            if trips {
                self.transition(&mut guard, CircuitBreakerState::Open);
                guard.opened_at = now;
            }
            return;
        }

        if !trips {
            return;
        }

        guard.consecutive_failures += 1;
        self.failure_count.store(guard.consecutive_failures, Ordering::SeqCst);
        if guard.consecutive_failures >= self.config.max_failures {
            self.transition(&mut guard, CircuitBreakerState::Open);
            guard.opened_at = now;
        }
    }
}

/// A group of breakers keyed by string, created lazily the first time a key
/// is used. Lookup takes a read lock; a miss upgrades to a write lock and
/// re-checks before inserting (double-checked creation).
pub struct CircuitBreakerGroup {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerGroup {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str, clock: &dyn Clock) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(key) {
            return Arc::clone(existing);
        }

        let mut guard = self.breakers.write().await;
        if let Some(existing) = guard.get(key) {
            return Arc::clone(existing);
        }

        let breaker = Arc::new(CircuitBreaker::new(self.config.clone(), clock));
        guard.insert(key.to_owned(), Arc::clone(&breaker));
        breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn config(max_failures: u32, timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures,
            max_requests_in_half_open: 1,
            interval: Duration::from_secs(60),
            timeout,
            should_trip: Arc::new(|_| true),
            on_state_change: None,
        }
    }

    #[tokio::test]
    async fn trips_open_after_max_consecutive_failures() {
        let clock = FixedClock::default();
        let breaker = CircuitBreaker::new(config(2, Duration::from_secs(10)), &clock);
        for _ in 0..2 {
            let _: Result<(), Error> = breaker
                .execute(&clock, || async { Err(Error::new(ErrorCode::Unavailable, "down")) })
                .await;
        }
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Open);

        let result: Result<(), Error> = breaker.execute(&clock, || async { Ok(()) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout_then_closed_on_success() {
        let clock = FixedClock::default();
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(5)), &clock);
        let _: Result<(), Error> = breaker
            .execute(&clock, || async { Err(Error::new(ErrorCode::Unavailable, "down")) })
            .await;
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Open);

        clock.advance(Duration::from_secs(6));
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::HalfOpen);

        let result: Result<(), Error> = breaker.execute(&clock, || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let clock = FixedClock::default();
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(5)), &clock);
        let _: Result<(), Error> = breaker
            .execute(&clock, || async { Err(Error::new(ErrorCode::Unavailable, "down")) })
            .await;
        clock.advance(Duration::from_secs(6));
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::HalfOpen);

        let _: Result<(), Error> = breaker
            .execute(&clock, || async { Err(Error::new(ErrorCode::Unavailable, "still down")) })
            .await;
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn non_tripping_failures_do_not_count() {
        let clock = FixedClock::default();
        let mut cfg = config(2, Duration::from_secs(5));
        cfg.should_trip = Arc::new(|err| err.code != ErrorCode::InvalidArgument);
        let breaker = CircuitBreaker::new(cfg, &clock);

        for _ in 0..5 {
            let _: Result<(), Error> = breaker
                .execute(&clock, || async { Err(Error::new(ErrorCode::InvalidArgument, "bad input")) })
                .await;
        }
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn fallback_invoked_when_open() {
        let clock = FixedClock::default();
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(30)), &clock);
        let _: Result<(), Error> = breaker
            .execute(&clock, || async { Err(Error::new(ErrorCode::Unavailable, "down")) })
            .await;
        assert_eq!(breaker.state(&clock).await, CircuitBreakerState::Open);

        let result = breaker
            .execute_with_fallback(&clock, || async { Ok::<_, Error>(1) }, || async { Ok::<_, Error>(99) })
            .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn group_creates_breakers_lazily_and_reuses_them() {
        let clock = FixedClock::default();
        let group = CircuitBreakerGroup::new(config(5, Duration::from_secs(30)));
        let a1 = group.get("app-a", &clock).await;
        let a2 = group.get("app-a", &clock).await;
        let b1 = group.get("app-b", &clock).await;
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b1));
    }
}
