//! Retry engine and circuit breaker primitives used to wrap every fallible
//! step in the deploy path: artifact fetches, vault I/O, process starts.

pub mod circuit_breaker;
pub mod clock;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerGroup, CircuitBreakerState};
pub use clock::{Clock, FixedClock, RealClock};
pub use retry::{retry, AdaptiveRetrier, RetryConfig, RetryContext};
