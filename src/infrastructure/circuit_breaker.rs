//! Circuit breaker for remote operations
//!
//! One breaker wraps one remote operation (platform + endpoint). Rejected
//! calls while Open never invoke the wrapped operation and do not count as
//! attempts. Internal deadlines use the monotonic clock; wall-clock times
//! are derived only for error payloads and status snapshots.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::events::{CircuitState, CircuitTransition};
use crate::domain::repositories::{TelemetrySink, TracingTelemetry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a trial call is allowed, in milliseconds.
    pub reset_timeout_ms: u64,
    /// Successes required in HalfOpen before closing again.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    next_attempt_at: Option<Instant>,
    last_error: Option<String>,
    total_failures: u64,
    total_successes: u64,
}

/// Failure-isolation state machine for one protected operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(name, config, Arc::new(TracingTelemetry))
    }

    pub fn with_telemetry(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                next_attempt_at: None,
                last_error: None,
                total_failures: 0,
                total_successes: 0,
            }),
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation under this breaker.
    pub async fn call<T, F, Fut>(&self, operation: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        self.before_call().await?;

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success().await,
            Err(err) => self.on_failure(err).await,
        }
        result
    }

    /// Gate a call: pass in Closed, reject or trial in Open, bounded trials
    /// in HalfOpen.
    async fn before_call(&self) -> DispatchResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let ready = inner
                    .next_attempt_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if ready {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(self.open_error(&inner))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_success_threshold {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(self.open_error(&inner))
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    async fn on_failure(&self, error: &DispatchError) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_error = Some(error.to_string());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to Closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            next_attempt_at: inner.next_attempt_at.map(instant_to_utc),
            last_error: inner.last_error.clone(),
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    fn open_error(&self, inner: &BreakerInner) -> DispatchError {
        DispatchError::CircuitOpen {
            next_attempt_at: inner
                .next_attempt_at
                .map(instant_to_utc)
                .unwrap_or_else(Utc::now),
            last_error: inner.last_error.clone(),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        match next {
            CircuitState::Open => {
                inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout());
                inner.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                inner.next_attempt_at = None;
            }
        }

        let event = CircuitTransition {
            operation: self.name.clone(),
            previous,
            next,
            timestamp: Utc::now(),
            last_error: inner.last_error.clone(),
        };
        info!(
            breaker = %self.name,
            previous = %previous,
            next = %next,
            "circuit breaker transition"
        );
        self.telemetry.circuit_transition(&event);
    }
}

/// Project a monotonic deadline onto the wall clock for reporting.
fn instant_to_utc(at: Instant) -> DateTime<Utc> {
    let now = Instant::now();
    if at >= now {
        Utc::now() + chrono::Duration::milliseconds((at - now).as_millis() as i64)
    } else {
        Utc::now() - chrono::Duration::milliseconds((now - at).as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, reset_ms: u64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_success_threshold: half_open,
        }
    }

    fn failing() -> DispatchResult<()> {
        Err(DispatchError::storage("upstream exploded"))
    }

    #[tokio::test]
    async fn opens_exactly_at_failure_threshold() {
        let breaker = CircuitBreaker::new("test", config(3, 30_000, 2));

        for _ in 0..2 {
            let _ = breaker.call(|| async { failing() }).await;
            assert_eq!(breaker.status().await.state, CircuitState::Closed);
        }

        let _ = breaker.call(|| async { failing() }).await;
        let status = breaker.status().await;
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn open_circuit_never_invokes_the_operation() {
        let breaker = CircuitBreaker::new("test", config(1, 30_000, 2));
        let calls = AtomicU32::new(0);

        let _ = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                failing()
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            let result = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    failing()
                })
                .await;
            assert!(matches!(result, Err(DispatchError::CircuitOpen { .. })));
        }
        // call count unchanged across rejected calls
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_reset_timeout_then_closes() {
        let breaker = CircuitBreaker::new("test", config(1, 1_000, 2));
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_100)).await;

        // trial call allowed through and succeeds
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.status().await.state, CircuitState::HalfOpen);

        // second success reaches the threshold and closes
        breaker.call(|| async { Ok(()) }).await.unwrap();
        let status = breaker.status().await;
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(1, 1_000, 2));
        let _ = breaker.call(|| async { failing() }).await;

        tokio::time::advance(Duration::from_millis(1_100)).await;

        let _ = breaker.call(|| async { failing() }).await;
        let status = breaker.status().await;
        assert_eq!(status.state, CircuitState::Open);
        // the cooldown restarted
        assert!(status.next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn rejection_carries_last_error() {
        let breaker = CircuitBreaker::new("test", config(1, 30_000, 2));
        let _ = breaker.call(|| async { failing() }).await;

        let err = breaker.call(|| async { Ok(()) }).await.unwrap_err();
        match err {
            DispatchError::CircuitOpen { last_error, .. } => {
                assert!(last_error.unwrap().contains("upstream exploded"));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = CircuitBreaker::new("test", config(1, 30_000, 2));
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.status().await.state, CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.status().await.state, CircuitState::Closed);
        breaker.call(|| async { Ok(()) }).await.unwrap();
    }
}
