// Prometheus metrics for the gateway
//
// Exposed on /metrics by the HTTP server:
// - Command validations by policy and outcome (counter)
// - Security violations by kind (counter)
// - Executions by final status (counter)
// - Execution duration (histogram)
// - Status polls per execution (histogram)
//
// Metrics live in a registry owned by `GatewayMetrics`; there are no process-wide
// statics, so each server or test builds its own.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

use crate::security::{SecurityPolicy, ViolationKind};

/// Gateway metrics and the registry they are registered in
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    validations_total: IntCounterVec,
    violations_total: IntCounterVec,
    executions_total: IntCounterVec,
    execution_duration_seconds: Histogram,
    poll_attempts: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let validations_total = IntCounterVec::new(
            Opts::new("vmshell_validations_total", "Command validations by policy and outcome"),
            &["policy", "outcome"],
        )?;
        let violations_total = IntCounterVec::new(
            Opts::new("vmshell_violations_total", "Rejected commands by violation kind"),
            &["kind"],
        )?;
        let executions_total = IntCounterVec::new(
            Opts::new("vmshell_executions_total", "Command executions by final status"),
            &["status"],
        )?;
        let execution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vmshell_execution_duration_seconds",
                "Time from request to final result",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let poll_attempts = Histogram::with_opts(
            HistogramOpts::new("vmshell_poll_attempts", "exec-status queries per execution")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 120.0]),
        )?;

        registry.register(Box::new(validations_total.clone()))?;
        registry.register(Box::new(violations_total.clone()))?;
        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;
        registry.register(Box::new(poll_attempts.clone()))?;

        Ok(Self {
            registry,
            validations_total,
            violations_total,
            executions_total,
            execution_duration_seconds,
            poll_attempts,
        })
    }

    /// Record one validation; `violation` is `None` for accepted commands
    pub fn record_validation(&self, policy: SecurityPolicy, violation: Option<ViolationKind>) {
        let outcome = match violation {
            None => "accepted",
            Some(kind) => {
                self.violations_total.with_label_values(&[kind.code()]).inc();
                "rejected"
            }
        };
        self.validations_total
            .with_label_values(&[policy.as_str(), outcome])
            .inc();
    }

    /// Record a finished execution under its final status label
    pub fn record_execution(&self, status: &str, duration: Duration) {
        self.executions_total.with_label_values(&[status]).inc();
        self.execution_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_poll_attempts(&self, attempts: u32) {
        self.poll_attempts.observe(f64::from(attempts));
    }

    /// Render all metrics in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
    }
}
