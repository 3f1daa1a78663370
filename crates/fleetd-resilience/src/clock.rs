//! Time abstraction so retry/breaker/vault-TTL logic can be driven
//! deterministically in tests instead of racing real wall-clock sleeps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of monotonic-enough time. `now()` is used for deadlines and
/// interval bookkeeping; `sleep()` is the interruptible wait point.
#[async_trait::async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time since the Unix epoch, real `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock whose `now()` is set explicitly and whose `sleep()` returns
/// immediately after advancing the stored time by the requested duration.
/// Lets tests assert on computed backoffs without actually waiting.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    #[must_use]
    pub fn new(start: Duration) -> Self {
        Self {
            millis: AtomicI64::new(i64::try_from(start.as_millis()).unwrap_or(i64::MAX)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(i64::try_from(by.as_millis()).unwrap_or(i64::MAX), Ordering::SeqCst);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait::async_trait]
impl Clock for FixedClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst).max(0) as u64)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_clock_advances_on_sleep() {
        let clock = FixedClock::new(Duration::from_secs(1));
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn real_clock_now_is_nonzero() {
        let clock = RealClock;
        assert!(clock.now() > Duration::ZERO);
    }
}
