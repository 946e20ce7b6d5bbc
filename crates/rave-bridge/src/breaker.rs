use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rave_core::{Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub call_timeout: Duration,
    pub max_requests_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
            max_requests_half_open: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct CallAttempt {
    at: Instant,
    success: bool,
    duration: Duration,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    pub state_transitions: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    half_open_in_flight: u32,
    history: Vec<CallAttempt>,
    stats: BreakerStats,
}

const MAX_HISTORY: usize = 1000;

/// Three-state circuit breaker guarding one external dependency.
///
/// The lock covers only state decisions and counter updates; the wrapped
/// call runs outside it. Only errors accepted by the `expected` classifier
/// trip the breaker — anything else propagates without touching the
/// failure count.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    expected: Box<dyn Fn(&Error) -> bool + Send + Sync>,
    state: Mutex<BreakerState>,
}

/// Health snapshot for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub time_until_retry_secs: u64,
    pub recent_success_rate: f64,
    pub recent_avg_duration_ms: f64,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        expected: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_s = config.recovery_timeout.as_secs(),
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            expected: Box::new(expected),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                half_open_in_flight: 0,
                history: Vec::new(),
                stats: BreakerStats::default(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock().unwrap();
        self.refresh_state(&mut guard);
        guard.state
    }

    /// Execute `fut` under the breaker with the per-call timeout.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let entered_half_open = {
            let mut guard = self.state.lock().unwrap();
            self.refresh_state(&mut guard);

            match guard.state {
                CircuitState::Open => {
                    guard.stats.rejected_calls += 1;
                    let retry_after = self.retry_after(&guard);
                    return Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_after,
                    });
                }
                CircuitState::HalfOpen => {
                    if guard.half_open_in_flight >= self.config.max_requests_half_open {
                        guard.stats.rejected_calls += 1;
                        let retry_after = self.retry_after(&guard);
                        return Err(Error::CircuitOpen {
                            name: self.name.clone(),
                            retry_after,
                        });
                    }
                    guard.half_open_in_flight += 1;
                    true
                }
                CircuitState::Closed => false,
            }
        };

        let start = Instant::now();
        {
            let mut guard = self.state.lock().unwrap();
            guard.stats.total_calls += 1;
        }

        let result = match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_err = Error::transient(format!(
                    "call timed out after {}s",
                    self.config.call_timeout.as_secs()
                ));
                let mut guard = self.state.lock().unwrap();
                guard.stats.timeouts += 1;
                if entered_half_open {
                    guard.half_open_in_flight = guard.half_open_in_flight.saturating_sub(1);
                }
                self.record_failure(&mut guard, start.elapsed());
                return Err(timeout_err);
            }
        };

        let mut guard = self.state.lock().unwrap();
        if entered_half_open {
            guard.half_open_in_flight = guard.half_open_in_flight.saturating_sub(1);
        }
        match &result {
            Ok(_) => self.record_success(&mut guard, start.elapsed()),
            Err(e) if (self.expected)(e) => self.record_failure(&mut guard, start.elapsed()),
            // Unexpected error kinds do not trip the breaker.
            Err(_) => self.record_success(&mut guard, start.elapsed()),
        }
        result
    }

    fn refresh_state(&self, guard: &mut BreakerState) {
        if guard.state == CircuitState::Open {
            let elapsed = guard
                .last_failure_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.recovery_timeout {
                self.transition(guard, CircuitState::HalfOpen);
                guard.success_count = 0;
                guard.half_open_in_flight = 0;
            }
        }
    }

    fn retry_after(&self, guard: &BreakerState) -> Duration {
        guard
            .last_failure_at
            .map(|at| self.config.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or(self.config.recovery_timeout)
    }

    fn record_success(&self, guard: &mut BreakerState, duration: Duration) {
        guard.stats.successful_calls += 1;
        push_history(guard, CallAttempt {
            at: Instant::now(),
            success: true,
            duration,
        });

        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    self.transition(guard, CircuitState::Closed);
                    guard.failure_count = 0;
                    guard.success_count = 0;
                }
            }
            CircuitState::Closed => {
                guard.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, guard: &mut BreakerState, duration: Duration) {
        guard.stats.failed_calls += 1;
        guard.failure_count += 1;
        guard.last_failure_at = Some(Instant::now());
        push_history(guard, CallAttempt {
            at: Instant::now(),
            success: false,
            duration,
        });

        match guard.state {
            CircuitState::Closed => {
                if guard.failure_count >= self.config.failure_threshold {
                    self.transition(guard, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(guard, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, guard: &mut BreakerState, to: CircuitState) {
        if guard.state == to {
            return;
        }
        let from = guard.state;
        guard.state = to;
        guard.stats.state_transitions += 1;
        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %from,
                failure_count = guard.failure_count,
                "circuit breaker opened"
            ),
            _ => info!(breaker = %self.name, from = %from, to = %to, "circuit breaker transitioned"),
        }
    }

    /// Reset to closed with cleared counters, history, and statistics.
    pub fn reset(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.last_failure_at = None;
        guard.half_open_in_flight = 0;
        guard.history.clear();
        guard.stats = BreakerStats::default();
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Operator override: refuse all calls until reset or recovery.
    pub fn force_open(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.last_failure_at = Some(Instant::now());
        self.transition(&mut guard, CircuitState::Open);
    }

    /// Operator override: resume normal operation immediately.
    pub fn force_closed(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.failure_count = 0;
        guard.success_count = 0;
        self.transition(&mut guard, CircuitState::Closed);
    }

    pub fn stats(&self) -> BreakerStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn health(&self) -> BreakerHealth {
        let mut guard = self.state.lock().unwrap();
        self.refresh_state(&mut guard);

        let recent: Vec<&CallAttempt> = guard
            .history
            .iter()
            .filter(|a| a.at.elapsed() < Duration::from_secs(300))
            .collect();
        let (success_rate, avg_ms) = if recent.is_empty() {
            (0.0, 0.0)
        } else {
            let successes = recent.iter().filter(|a| a.success).count();
            let total_ms: f64 = recent.iter().map(|a| a.duration.as_secs_f64() * 1000.0).sum();
            (
                successes as f64 / recent.len() as f64,
                total_ms / recent.len() as f64,
            )
        };

        BreakerHealth {
            name: self.name.clone(),
            state: guard.state,
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            time_until_retry_secs: if guard.state == CircuitState::Open {
                self.retry_after(&guard).as_secs()
            } else {
                0
            },
            recent_success_rate: success_rate,
            recent_avg_duration_ms: avg_ms,
        }
    }
}

fn push_history(guard: &mut BreakerState, attempt: CallAttempt) {
    guard.history.push(attempt);
    if guard.history.len() > MAX_HISTORY {
        let keep_from = guard.history.len() - MAX_HISTORY / 2;
        guard.history.drain(..keep_from);
    }
}

/// Registry of named breakers; the health endpoint reports all of them.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a breaker, returning the existing one when the
    /// name is already taken.
    pub fn create(
        &self,
        name: &str,
        config: BreakerConfig,
        expected: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(existing) = breakers.get(name) {
            debug!(breaker = name, "circuit breaker already registered");
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config, expected));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().unwrap().get(name).cloned()
    }

    pub fn health_all(&self) -> Vec<BreakerHealth> {
        let mut all: Vec<BreakerHealth> = self
            .breakers
            .lock()
            .unwrap()
            .values()
            .map(|b| b.health())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// True when any registered breaker is open.
    pub fn any_open(&self) -> bool {
        self.health_all()
            .iter()
            .any(|h| h.state == CircuitState::Open)
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().unwrap().values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold,
                recovery_timeout: recovery,
                success_threshold,
                call_timeout: Duration::from_secs(5),
                max_requests_half_open: 3,
            },
            Error::is_transient,
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(async { Err::<(), _>(Error::transient("boom")) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32> {
        b.call(async { Ok(1u32) }).await
    }

    #[tokio::test]
    async fn test_opens_at_failure_threshold() {
        let b = breaker(3, Duration::from_secs(60), 2);
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        // Fourth call refused without executing.
        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_open_recovers_through_half_open() {
        let b = breaker(3, Duration::from_millis(50), 2);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let b = breaker(2, Duration::from_millis(50), 2);
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unexpected_errors_do_not_trip() {
        let b = breaker(2, Duration::from_secs(60), 2);
        for _ in 0..5 {
            let result: Result<()> = b
                .call(async { Err(Error::validation("not a dependency failure")) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_closed_failure_count() {
        let b = breaker(3, Duration::from_secs(60), 2);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        // Two consecutive failures after a reset: still closed.
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let b = CircuitBreaker::new(
            "slow",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
                call_timeout: Duration::from_millis(20),
                max_requests_half_open: 1,
            },
            Error::is_transient,
        );
        let result: Result<()> = b
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let b = breaker(3, Duration::from_secs(60), 2);
        b.force_open();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&b).await.unwrap_err(),
            Error::CircuitOpen { .. }
        ));
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(succeed(&b).await.is_ok());
        b.force_open();
        b.force_closed();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_dedupes_and_reports_health() {
        let registry = BreakerRegistry::new();
        let a = registry.create("systemd", BreakerConfig::default(), Error::is_transient);
        let b = registry.create("systemd", BreakerConfig::default(), Error::is_transient);
        assert!(Arc::ptr_eq(&a, &b));

        registry.create("idp", BreakerConfig::default(), Error::is_transient);
        assert_eq!(registry.health_all().len(), 2);
        assert!(!registry.any_open());
        a.force_open();
        assert!(registry.any_open());
        registry.reset_all();
        assert!(!registry.any_open());
    }
}
