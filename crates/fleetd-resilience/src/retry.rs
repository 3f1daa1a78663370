//! Bounded retry with exponential backoff, jitter, and an adaptive variant
//! that tunes its own attempt budget from observed success rate.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use fleetd_errors::{Error, ErrorCode};
use rand::Rng;

use crate::clock::Clock;

/// Static retry configuration: backoff shape and the attempt budget.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.1,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = delay.as_millis() as f64 * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (delay.as_millis() as f64 + offset).max(0.0);
        Duration::from_millis(millis as u64)
    }
}

/// Cancellation signal for an in-flight retry loop. A cancelled context
/// during a backoff sleep turns into `deadline-exceeded` wrapping the cause.
#[derive(Clone, Default)]
pub struct RetryContext {
    cancel: tokio_util_cancel::CancelHandle,
}

impl RetryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Minimal cancellation token so this crate doesn't have to pull in
/// `tokio-util` for a single boolean flag shared across clones.
mod tokio_util_cancel {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct CancelHandle(Arc<AtomicBool>);

    impl CancelHandle {
        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

/// Run `op` up to `config.max_attempts` times, retrying only while
/// `retryable(&err)` holds, honoring `err.retry_after` as an override delay,
/// and racing each backoff sleep against `ctx` cancellation.
///
/// On exhaustion, returns `resource-exhausted` wrapping the last error with
/// message `"operation failed after N attempts"`.
pub async fn retry<T, F, Fut>(
    ctx: &RetryContext,
    clock: &dyn Clock,
    config: &RetryConfig,
    retryable: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 0..config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !retryable(&err) {
                    return Err(err);
                }
                let delay = err
                    .retry_after
                    .unwrap_or_else(|| config.jittered(config.delay_for_attempt(attempt)));
                last_err = Some(err);

                if attempt + 1 < config.max_attempts {
                    if ctx.is_cancelled() {
                        let cause = last_err.expect("set above");
                        return Err(Error::wrap(cause, ErrorCode::DeadlineExceeded, "retry cancelled during backoff"));
                    }
                    clock.sleep(delay).await;
                    if ctx.is_cancelled() {
                        let cause = last_err.take().expect("set above");
                        return Err(Error::wrap(cause, ErrorCode::DeadlineExceeded, "retry cancelled during backoff"));
                    }
                }
            }
        }
    }

    let cause = last_err.expect("loop always runs at least once for max_attempts >= 1");
    Err(Error::wrap(
        cause,
        ErrorCode::ResourceExhausted,
        format!("operation failed after {} attempts", config.max_attempts),
    ))
}

#[derive(Debug, Default)]
struct AdaptiveCounters {
    successes: AtomicU32,
    failures: AtomicU32,
}

impl AdaptiveCounters {
    fn reset(&self) {
        self.successes.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
    }

    fn samples(&self) -> u32 {
        self.successes.load(Ordering::SeqCst) + self.failures.load(Ordering::SeqCst)
    }

    fn success_rate(&self) -> f64 {
        let successes = self.successes.load(Ordering::SeqCst) as f64;
        let total = self.samples() as f64;
        if total == 0.0 {
            1.0
        } else {
            successes / total
        }
    }
}

/// Retry engine that re-tunes `max_attempts`/`initial_delay` every
/// `adjust_interval` based on observed success rate, without locking the
/// config on every call — the snapshot is swapped atomically (`ArcSwap`) so
/// in-flight retries keep using the config they started with.
pub struct AdaptiveRetrier {
    config: ArcSwap<RetryConfig>,
    counters: AdaptiveCounters,
    adjust_interval: Duration,
    last_adjusted: std::sync::Mutex<Duration>,
}

impl AdaptiveRetrier {
    #[must_use]
    pub fn new(initial: RetryConfig, clock: &dyn Clock) -> Self {
        Self {
            config: ArcSwap::from_pointee(initial),
            counters: AdaptiveCounters::default(),
            adjust_interval: Duration::from_secs(60),
            last_adjusted: std::sync::Mutex::new(clock.now()),
        }
    }

    #[must_use]
    pub fn config(&self) -> Arc<RetryConfig> {
        self.config.load_full()
    }

    /// Execute `op` with the current config snapshot, recording the outcome
    /// and triggering a re-tune check afterward.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        clock: &dyn Clock,
        retryable: impl Fn(&Error) -> bool,
        op: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let snapshot = self.config.load_full();
        let result = retry(ctx, clock, &snapshot, retryable, op).await;
        if result.is_ok() {
            self.counters.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.failures.fetch_add(1, Ordering::SeqCst);
        }
        self.maybe_adjust(clock);
        result
    }

    fn maybe_adjust(&self, clock: &dyn Clock) {
        let now = clock.now();
        let mut last = self.last_adjusted.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if now.saturating_sub(*last) < self.adjust_interval {
            return;
        }
        if self.counters.samples() < 10 {
            return;
        }

        let rate = self.counters.success_rate();
        let current = self.config.load_full();
        let mut next = (*current).clone();

        if rate > 0.95 {
            next.max_attempts = (next.max_attempts.saturating_sub(1)).max(2);
            next.initial_delay = scale_duration(next.initial_delay, 2.0 / 3.0);
        } else if rate < 0.80 {
            next.max_attempts = (next.max_attempts + 1).min(10);
            next.initial_delay = scale_duration(next.initial_delay, 3.0 / 2.0);
        }

        self.config.store(Arc::new(next));
        self.counters.reset();
        *last = now;
    }
}

fn scale_duration(d: Duration, factor: f64) -> Duration {
    Duration::from_millis((d.as_millis() as f64 * factor).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    fn always_retryable(_: &Error) -> bool {
        true
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        let config = RetryConfig::default();
        let result: Result<u32, Error> = retry(&ctx, &clock, &config, always_retryable, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        let config = RetryConfig::new(5, Duration::from_millis(10), Duration::from_secs(1), 2.0);
        let attempts = StdAtomicU32::new(0);
        let result: Result<u32, Error> = retry(&ctx, &clock, &config, always_retryable, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::new(ErrorCode::Unavailable, "not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_and_wraps_resource_exhausted() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0);
        let result: Result<(), Error> = retry(&ctx, &clock, &config, always_retryable, || async {
            Err(Error::new(ErrorCode::Unavailable, "still down"))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceExhausted);
        assert!(err.message.contains("3 attempts"));
        assert_eq!(err.root_cause().code, ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn fails_fast_when_not_retryable() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        let config = RetryConfig::default();
        let attempts = StdAtomicU32::new(0);
        let result: Result<(), Error> = retry(&ctx, &clock, &config, |_| false, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::new(ErrorCode::InvalidArgument, "nope")) }
        })
        .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respects_retry_after_override() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        let config = RetryConfig::new(2, Duration::from_secs(10), Duration::from_secs(20), 2.0);
        let attempts = StdAtomicU32::new(0);
        let _: Result<(), Error> = retry(&ctx, &clock, &config, always_retryable, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::new(ErrorCode::RateLimited, "slow down").with_retry_after(Duration::from_millis(250)))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(clock.now(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_yields_deadline_exceeded() {
        let clock = FixedClock::default();
        let ctx = RetryContext::new();
        ctx.cancel();
        let config = RetryConfig::new(3, Duration::from_millis(10), Duration::from_millis(20), 2.0);
        let result: Result<(), Error> = retry(&ctx, &clock, &config, always_retryable, || async {
            Err(Error::new(ErrorCode::Unavailable, "down"))
        })
        .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn adaptive_retrier_tightens_on_high_success_rate() {
        let clock = FixedClock::default();
        let retrier = AdaptiveRetrier::new(RetryConfig::new(5, Duration::from_millis(100), Duration::from_secs(1), 2.0), &clock);
        for _ in 0..12 {
            let _: Result<(), Error> = retrier.run(&RetryContext::new(), &clock, always_retryable, || async { Ok(()) }).await;
        }
        clock.advance(Duration::from_secs(61));
        let _: Result<(), Error> = retrier.run(&RetryContext::new(), &clock, always_retryable, || async { Ok(()) }).await;
        let tuned = retrier.config();
        assert!(tuned.max_attempts <= 4);
    }
}
