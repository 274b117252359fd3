use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolCounters {
    pub calls: u64,
    pub failures: u64,
}

/// Dispatch counters exposed through the control API
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub dispatch_total: u64,
    pub dispatch_ok: u64,
    pub dispatch_failed: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub remote_calls: u64,
    pub total_latency_ms: u64,
    pub per_tool: HashMap<String, ToolCounters>,
    /// Failures keyed by error code
    pub errors: HashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful dispatch
    pub fn record_success(&mut self, tool: &str, elapsed: Duration) {
        self.dispatch_total += 1;
        self.dispatch_ok += 1;
        self.total_latency_ms += elapsed.as_millis() as u64;
        self.per_tool.entry(tool.to_string()).or_default().calls += 1;
    }

    /// Record a failed dispatch. Unknown tool names are counted only by
    /// error code so `per_tool` stays bounded by the catalogue.
    pub fn record_failure(&mut self, tool: &str, code: ErrorCode, elapsed: Duration) {
        self.dispatch_total += 1;
        self.dispatch_failed += 1;
        self.total_latency_ms += elapsed.as_millis() as u64;
        if code == ErrorCode::Timeout {
            self.timeouts += 1;
        }
        if code != ErrorCode::NotFound {
            let counters = self.per_tool.entry(tool.to_string()).or_default();
            counters.calls += 1;
            counters.failures += 1;
        }
        *self.errors.entry(code.to_string()).or_default() += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_remote(&mut self) {
        self.remote_calls += 1;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.dispatch_total == 0 {
            return 100.0;
        }
        (self.dispatch_ok as f64 / self.dispatch_total as f64) * 100.0
    }

    pub fn mean_latency_ms(&self) -> f64 {
        if self.dispatch_total == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.dispatch_total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.dispatch_total, 0);
        assert!(metrics.per_tool.is_empty());
        assert_eq!(metrics.success_rate(), 100.0);
        assert_eq!(metrics.mean_latency_ms(), 0.0);
    }

    #[test]
    fn test_record_mixed() {
        let mut metrics = Metrics::new();
        metrics.record_success("echo", Duration::from_millis(10));
        metrics.record_success("echo", Duration::from_millis(20));
        metrics.record_failure("echo", ErrorCode::HandlerError, Duration::from_millis(30));
        metrics.record_failure("slow", ErrorCode::Timeout, Duration::from_millis(100));

        assert_eq!(metrics.dispatch_total, 4);
        assert_eq!(metrics.dispatch_ok, 2);
        assert_eq!(metrics.dispatch_failed, 2);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.success_rate(), 50.0);
        assert_eq!(metrics.mean_latency_ms(), 40.0);
        assert_eq!(
            metrics.per_tool["echo"],
            ToolCounters {
                calls: 3,
                failures: 1
            }
        );
        assert_eq!(metrics.errors["Timeout"], 1);
    }

    #[test]
    fn test_unknown_tools_not_tracked_per_tool() {
        let mut metrics = Metrics::new();
        for i in 0..500 {
            metrics.record_failure(&format!("ghost_{}", i), ErrorCode::NotFound, Duration::ZERO);
        }
        assert!(metrics.per_tool.is_empty());
        assert_eq!(metrics.errors["NotFound"], 500);
        assert_eq!(metrics.dispatch_failed, 500);
    }

    #[test]
    fn test_metrics_serialization() {
        let mut metrics = Metrics::new();
        metrics.record_success("echo", Duration::from_millis(1));
        metrics.record_retry();

        let json = serde_json::to_string(&metrics).unwrap();
        let deserialized: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.dispatch_ok, 1);
        assert_eq!(deserialized.retries, 1);
    }
}
