use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use rave_core::{Error, Result};

/// Bridge metrics registry and instruments.
pub struct BridgeMetrics {
    registry: Registry,
    pub requests: IntCounterVec,
    pub request_duration: HistogramVec,
    pub commands: IntCounterVec,
    pub auth_failures: IntCounterVec,
    pub systemd_operations: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("rave_bridge_requests_total", "Total bridge requests"),
            &["method", "endpoint", "status"],
        )
        .map_err(internal)?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "rave_bridge_request_duration_seconds",
                "Bridge request duration",
            ),
            &[],
        )
        .map_err(internal)?;
        let commands = IntCounterVec::new(
            Opts::new("rave_bridge_commands_total", "Total commands processed"),
            &["command", "status", "user"],
        )
        .map_err(internal)?;
        let auth_failures = IntCounterVec::new(
            Opts::new(
                "rave_bridge_auth_failures_total",
                "Total authentication failures",
            ),
            &["reason"],
        )
        .map_err(internal)?;
        let systemd_operations = IntCounterVec::new(
            Opts::new(
                "rave_bridge_systemd_operations_total",
                "Total systemd operations",
            ),
            &["operation", "agent", "status"],
        )
        .map_err(internal)?;

        registry.register(Box::new(requests.clone())).map_err(internal)?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(internal)?;
        registry.register(Box::new(commands.clone())).map_err(internal)?;
        registry
            .register(Box::new(auth_failures.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(systemd_operations.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            commands,
            auth_failures,
            systemd_operations,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(internal)?;
        String::from_utf8(buf).map_err(|e| Error::internal(e.to_string()))
    }
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_in_exposition() {
        let m = BridgeMetrics::new().unwrap();
        m.requests
            .with_label_values(&["POST", "/webhook", "200"])
            .inc();
        m.commands
            .with_label_values(&["start-agent", "success", "@a:b"])
            .inc();
        m.auth_failures.with_label_values(&["rate_limit"]).inc();
        m.systemd_operations
            .with_label_values(&["start", "api-tester", "success"])
            .inc();
        m.request_duration.with_label_values(&[]).observe(0.25);

        let text = m.render().unwrap();
        assert!(text.contains("rave_bridge_requests_total"));
        assert!(text.contains("rave_bridge_commands_total"));
        assert!(text.contains("rave_bridge_auth_failures_total"));
        assert!(text.contains("rave_bridge_systemd_operations_total"));
        assert!(text.contains("rave_bridge_request_duration_seconds"));
    }
}
