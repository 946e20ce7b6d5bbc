use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rave_core::{time, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

const REQUEST_HISTORY_CAP: usize = 100;
const LOAD_SAMPLE_INTERVAL_SECS: f64 = 5.0;
const LOAD_HISTORY_CAP: usize = 60;

/// Rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    /// Sliding window length in seconds.
    pub window_size: f64,
    /// Idle clients older than twice this interval are evicted.
    pub cleanup_interval: Duration,
    pub adaptive_enabled: bool,
    pub max_burst_multiplier: f64,
    pub min_rate_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            window_size: 60.0,
            cleanup_interval: Duration::from_secs(300),
            adaptive_enabled: true,
            max_burst_multiplier: 2.0,
            min_rate_multiplier: 0.1,
        }
    }
}

/// Caller context feeding the adaptive multiplier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub admin: bool,
    pub status_only: bool,
}

impl RequestContext {
    fn factor(&self) -> f64 {
        if self.admin {
            2.0
        } else if self.status_only {
            1.5
        } else {
            1.0
        }
    }
}

/// Per-client tracking state.
#[derive(Debug, Clone)]
struct ClientMetrics {
    requests_made: u64,
    requests_blocked: u64,
    last_request_time: f64,
    burst_tokens: f64,
    request_times: VecDeque<f64>,
}

/// Effective limits for one call after adaptive adjustment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EffectiveLimits {
    pub requests_per_minute: f64,
    pub burst_size: f64,
    pub load_factor: f64,
    pub context_factor: f64,
}

/// Aggregate counters for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LimiterStats {
    pub total_requests: u64,
    pub total_allowed: u64,
    pub total_blocked: u64,
    pub active_clients: usize,
    pub avg_system_load: f64,
}

/// Snapshot of one client's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub requests_made: u64,
    pub requests_blocked: u64,
    pub burst_tokens_available: f64,
    pub window_requests: usize,
    pub last_request: f64,
    pub blocked_ratio: f64,
}

/// Optional distributed backend: an atomic refill + window-trim +
/// allow/deny primitive against an external KV. Any error falls back to
/// local limiting in the same call.
#[async_trait::async_trait]
pub trait SharedLimiter: Send + Sync {
    async fn is_allowed(
        &self,
        client_id: &str,
        cost: u32,
        now: f64,
        limits: &EffectiveLimits,
        window_size: f64,
    ) -> Result<bool>;
}

struct AdaptiveState {
    load_history: VecDeque<f64>,
    current_load_factor: f64,
    last_load_check: f64,
    avg_load: f64,
}

/// Token-bucket + sliding-window limiter with load-adaptive thresholds.
///
/// The mutex guards O(1) map updates only; load sampling and the optional
/// distributed call happen outside it.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<String, ClientMetrics>>,
    adaptive: Mutex<AdaptiveState>,
    stats: Mutex<LimiterStats>,
    shared: Option<Arc<dyn SharedLimiter>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: Mutex::new(HashMap::new()),
            adaptive: Mutex::new(AdaptiveState {
                load_history: VecDeque::with_capacity(LOAD_HISTORY_CAP),
                current_load_factor: 1.0,
                last_load_check: 0.0,
                avg_load: 0.0,
            }),
            stats: Mutex::new(LimiterStats::default()),
            shared: None,
            shutdown: Mutex::new(None),
        })
    }

    pub fn with_shared_backend(config: RateLimitConfig, shared: Arc<dyn SharedLimiter>) -> Arc<Self> {
        let mut limiter = Self::new(config);
        // Arc::new above has a single owner here.
        Arc::get_mut(&mut limiter).unwrap().shared = Some(shared);
        limiter
    }

    /// Spawn the background cleanup task. Call `stop` on shutdown.
    pub fn start(self: Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let limiter = self;
        let interval = limiter.config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        limiter.cleanup_idle_clients(time::unix_now());
                    }
                    _ = rx.changed() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Check whether a request is allowed for the client.
    pub async fn is_allowed(
        &self,
        client_id: &str,
        cost: u32,
        context: RequestContext,
    ) -> bool {
        let now = time::unix_now();
        self.update_system_load(now);
        let limits = self.effective_limits(context);

        if let Some(shared) = &self.shared {
            match shared
                .is_allowed(client_id, cost, now, &limits, self.config.window_size)
                .await
            {
                Ok(allowed) => {
                    let mut stats = self.stats.lock().unwrap();
                    stats.total_requests += 1;
                    if allowed {
                        stats.total_allowed += 1;
                    } else {
                        stats.total_blocked += 1;
                    }
                    return allowed;
                }
                Err(e) => {
                    warn!(error = %e, "distributed rate limiting failed, falling back to local");
                }
            }
        }

        self.is_allowed_local(client_id, cost, now, &limits)
    }

    fn is_allowed_local(
        &self,
        client_id: &str,
        cost: u32,
        now: f64,
        limits: &EffectiveLimits,
    ) -> bool {
        let cost_f = f64::from(cost);
        let mut clients = self.clients.lock().unwrap();
        let metrics = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientMetrics {
                requests_made: 0,
                requests_blocked: 0,
                last_request_time: 0.0,
                burst_tokens: f64::from(self.config.burst_size),
                request_times: VecDeque::with_capacity(REQUEST_HISTORY_CAP),
            });

        refill_burst_tokens(metrics, now, limits);

        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;

        if metrics.burst_tokens < cost_f {
            metrics.requests_blocked += 1;
            stats.total_blocked += 1;
            debug!(
                client_id,
                burst_tokens = metrics.burst_tokens,
                cost,
                "request blocked - burst limit"
            );
            return false;
        }

        // Trim the sliding window, then check the per-minute ceiling.
        let window_start = now - self.config.window_size;
        while metrics
            .request_times
            .front()
            .map(|t| *t < window_start)
            .unwrap_or(false)
        {
            metrics.request_times.pop_front();
        }
        if metrics.request_times.len() as f64 + cost_f > limits.requests_per_minute {
            metrics.requests_blocked += 1;
            stats.total_blocked += 1;
            debug!(
                client_id,
                window_requests = metrics.request_times.len(),
                "request blocked - rate limit"
            );
            return false;
        }

        metrics.burst_tokens -= cost_f;
        metrics.requests_made += 1;
        metrics.last_request_time = now;
        for _ in 0..cost {
            if metrics.request_times.len() == REQUEST_HISTORY_CAP {
                metrics.request_times.pop_front();
            }
            metrics.request_times.push_back(now);
        }
        stats.total_allowed += 1;
        true
    }

    /// Current limits after load and context factors, clamped to the
    /// configured multiplier band.
    pub fn effective_limits(&self, context: RequestContext) -> EffectiveLimits {
        let base_rpm = f64::from(self.config.requests_per_minute);
        let base_burst = f64::from(self.config.burst_size);

        if !self.config.adaptive_enabled {
            return EffectiveLimits {
                requests_per_minute: base_rpm,
                burst_size: base_burst,
                load_factor: 1.0,
                context_factor: 1.0,
            };
        }

        let load_factor = self.adaptive.lock().unwrap().current_load_factor;
        let context_factor = context.factor();
        let total = load_factor * context_factor;

        let requests_per_minute = (base_rpm * total)
            .min(base_rpm * self.config.max_burst_multiplier)
            .max(base_rpm * self.config.min_rate_multiplier);
        let burst_size = (base_burst * total)
            .min(base_burst * self.config.max_burst_multiplier)
            .max(1.0);

        EffectiveLimits {
            requests_per_minute,
            burst_size,
            load_factor,
            context_factor,
        }
    }

    fn update_system_load(&self, now: f64) {
        let mut adaptive = self.adaptive.lock().unwrap();
        if now - adaptive.last_load_check < LOAD_SAMPLE_INTERVAL_SECS {
            return;
        }
        adaptive.last_load_check = now;

        let Some(normalized) = sample_normalized_load() else {
            adaptive.current_load_factor = 1.0;
            return;
        };

        if adaptive.load_history.len() == LOAD_HISTORY_CAP {
            adaptive.load_history.pop_front();
        }
        adaptive.load_history.push_back(normalized);

        let avg: f64 =
            adaptive.load_history.iter().sum::<f64>() / adaptive.load_history.len() as f64;
        adaptive.avg_load = avg;
        adaptive.current_load_factor = if avg < 0.5 {
            1.2
        } else if avg < 0.8 {
            1.0
        } else if avg < 1.2 {
            0.8
        } else {
            0.5
        };
        self.stats.lock().unwrap().avg_system_load = avg;
    }

    fn cleanup_idle_clients(&self, now: f64) {
        let cutoff = now - 2.0 * self.config.cleanup_interval.as_secs_f64();
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|_, m| m.last_request_time >= cutoff);
        let evicted = before - clients.len();
        self.stats.lock().unwrap().active_clients = clients.len();
        if evicted > 0 {
            debug!(count = evicted, "cleaned up idle rate-limit clients");
        }
    }

    pub fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        let clients = self.clients.lock().unwrap();
        let m = clients.get(client_id)?;
        let attempts = m.requests_made + m.requests_blocked;
        Some(ClientInfo {
            client_id: client_id.to_string(),
            requests_made: m.requests_made,
            requests_blocked: m.requests_blocked,
            burst_tokens_available: m.burst_tokens,
            window_requests: m.request_times.len(),
            last_request: m.last_request_time,
            blocked_ratio: if attempts == 0 {
                0.0
            } else {
                m.requests_blocked as f64 / attempts as f64
            },
        })
    }

    pub fn statistics(&self) -> LimiterStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.active_clients = self.clients.lock().unwrap().len();
        stats
    }

    /// Drop a client's limiter state entirely.
    pub fn reset_client(&self, client_id: &str) -> bool {
        self.clients.lock().unwrap().remove(client_id).is_some()
    }
}

fn refill_burst_tokens(metrics: &mut ClientMetrics, now: f64, limits: &EffectiveLimits) {
    if metrics.last_request_time == 0.0 {
        metrics.last_request_time = now;
        return;
    }
    let elapsed = (now - metrics.last_request_time).max(0.0);
    let refill_rate = limits.requests_per_minute / 60.0;
    metrics.burst_tokens = (metrics.burst_tokens + elapsed * refill_rate).min(limits.burst_size);
}

/// Normalized 1-minute load average (loadavg / CPU count).
fn sample_normalized_load() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load: f64 = text.split_whitespace().next()?.parse().ok()?;
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    Some(load / cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, burst: u32) -> Arc<RateLimiter> {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            burst_size: burst,
            adaptive_enabled: false,
            ..RateLimitConfig::default()
        })
    }

    fn flat_limits(rpm: u32, burst: u32) -> EffectiveLimits {
        EffectiveLimits {
            requests_per_minute: f64::from(rpm),
            burst_size: f64::from(burst),
            load_factor: 1.0,
            context_factor: 1.0,
        }
    }

    #[test]
    fn test_burst_exhaustion_then_refill() {
        // S1: rpm=60 burst=10; ten back-to-back calls pass, the eleventh
        // is blocked, and after one second at 1 token/s one call passes.
        let l = limiter(60, 10);
        let limits = flat_limits(60, 10);
        let t0 = 1_000_000.0;

        for i in 0..10 {
            assert!(l.is_allowed_local("c1", 1, t0, &limits), "call {i}");
        }
        assert!(!l.is_allowed_local("c1", 1, t0, &limits));
        assert!(l.is_allowed_local("c1", 1, t0 + 1.0, &limits));
    }

    #[test]
    fn test_sliding_window_ceiling() {
        // Burst big enough that only the window limits.
        let l = limiter(5, 100);
        let limits = flat_limits(5, 100);
        let t0 = 1_000_000.0;
        for i in 0..5 {
            assert!(l.is_allowed_local("c1", 1, t0 + i as f64 * 0.01, &limits));
        }
        assert!(!l.is_allowed_local("c1", 1, t0 + 0.1, &limits));
        // Once the window slides past the old timestamps, requests flow.
        assert!(l.is_allowed_local("c1", 1, t0 + 61.0, &limits));
    }

    #[test]
    fn test_clients_are_independent() {
        let l = limiter(60, 2);
        let limits = flat_limits(60, 2);
        let t0 = 1_000_000.0;
        assert!(l.is_allowed_local("a", 1, t0, &limits));
        assert!(l.is_allowed_local("a", 1, t0, &limits));
        assert!(!l.is_allowed_local("a", 1, t0, &limits));
        // Client b is untouched by a's exhaustion.
        assert!(l.is_allowed_local("b", 1, t0, &limits));
    }

    #[test]
    fn test_cost_consumes_multiple_tokens() {
        let l = limiter(60, 10);
        let limits = flat_limits(60, 10);
        let t0 = 1_000_000.0;
        assert!(l.is_allowed_local("c", 8, t0, &limits));
        assert!(!l.is_allowed_local("c", 8, t0, &limits));
        assert!(l.is_allowed_local("c", 2, t0, &limits));
    }

    #[test]
    fn test_context_factor_scales_limits() {
        let l = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
            adaptive_enabled: true,
            ..RateLimitConfig::default()
        });
        let plain = l.effective_limits(RequestContext::default());
        let admin = l.effective_limits(RequestContext {
            admin: true,
            ..Default::default()
        });
        let status = l.effective_limits(RequestContext {
            status_only: true,
            ..Default::default()
        });
        assert_eq!(admin.context_factor, 2.0);
        assert_eq!(status.context_factor, 1.5);
        assert!(admin.requests_per_minute >= plain.requests_per_minute);
        // Clamped to the max multiplier band.
        assert!(admin.requests_per_minute <= 60.0 * 2.0);
        assert!(admin.burst_size <= 10.0 * 2.0);
    }

    #[test]
    fn test_limits_clamped_to_minimum() {
        let l = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
            adaptive_enabled: true,
            ..RateLimitConfig::default()
        });
        l.adaptive.lock().unwrap().current_load_factor = 0.001;
        let limits = l.effective_limits(RequestContext::default());
        assert!(limits.requests_per_minute >= 60.0 * 0.1);
        assert!(limits.burst_size >= 1.0);
    }

    #[test]
    fn test_cleanup_evicts_idle_clients() {
        let l = limiter(60, 10);
        let limits = flat_limits(60, 10);
        let t0 = 1_000_000.0;
        assert!(l.is_allowed_local("old", 1, t0, &limits));
        assert!(l.is_allowed_local("fresh", 1, t0 + 650.0, &limits));
        l.cleanup_idle_clients(t0 + 660.0);
        assert!(l.client_info("old").is_none());
        assert!(l.client_info("fresh").is_some());
    }

    #[test]
    fn test_statistics_and_client_info() {
        let l = limiter(60, 1);
        let limits = flat_limits(60, 1);
        let t0 = 1_000_000.0;
        assert!(l.is_allowed_local("c", 1, t0, &limits));
        assert!(!l.is_allowed_local("c", 1, t0, &limits));

        let stats = l.statistics();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_allowed, 1);
        assert_eq!(stats.total_blocked, 1);

        let info = l.client_info("c").unwrap();
        assert_eq!(info.requests_made, 1);
        assert_eq!(info.requests_blocked, 1);
        assert!((info.blocked_ratio - 0.5).abs() < f64::EPSILON);

        assert!(l.reset_client("c"));
        assert!(!l.reset_client("c"));
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl SharedLimiter for FailingBackend {
        async fn is_allowed(
            &self,
            _client_id: &str,
            _cost: u32,
            _now: f64,
            _limits: &EffectiveLimits,
            _window_size: f64,
        ) -> Result<bool> {
            Err(rave_core::Error::transient("backend unreachable"))
        }
    }

    #[tokio::test]
    async fn test_shared_backend_failure_falls_back_to_local() {
        let l = RateLimiter::with_shared_backend(
            RateLimitConfig {
                requests_per_minute: 60,
                burst_size: 2,
                adaptive_enabled: false,
                ..RateLimitConfig::default()
            },
            Arc::new(FailingBackend),
        );
        // Local fallback still enforces the burst.
        assert!(l.is_allowed("c", 1, RequestContext::default()).await);
        assert!(l.is_allowed("c", 1, RequestContext::default()).await);
        assert!(!l.is_allowed("c", 1, RequestContext::default()).await);
    }
}
