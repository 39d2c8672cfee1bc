//! Metrics collection and Prometheus text exposition.
//!
//! The registry is constructed at boot by the composition root and passed
//! down; process-wide mutable state is limited to the logger and this
//! registry. Counters are atomics behind a lock-guarded map.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Latency accumulator for one operation.
#[derive(Debug, Default)]
struct LatencyAccumulator {
    count: u64,
    sum_ms: u64,
    max_ms: u64,
}

/// Metrics registry for the core.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Requests by (provider, action).
    requests: RwLock<HashMap<(String, String), AtomicU64>>,
    /// Changes by terminal-ish status transition.
    changes: RwLock<HashMap<String, AtomicU64>>,
    /// Notification deliveries by (channel, outcome).
    deliveries: RwLock<HashMap<(String, String), AtomicU64>>,
    /// Operation latency by action.
    latencies: RwLock<HashMap<String, LatencyAccumulator>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a request.
    pub fn record_request(&self, provider: &str, action: &str) {
        let mut counts = self.requests.write();
        counts
            .entry((provider.to_string(), action.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a change status transition.
    pub fn record_change_status(&self, status: &str) {
        let mut counts = self.changes.write();
        counts
            .entry(status.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a notification delivery outcome.
    pub fn record_delivery(&self, channel: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        let mut counts = self.deliveries.write();
        counts
            .entry((channel.to_string(), outcome.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Observes an operation latency in milliseconds.
    pub fn observe_latency(&self, action: &str, millis: u64) {
        let mut latencies = self.latencies.write();
        let acc = latencies.entry(action.to_string()).or_default();
        acc.count += 1;
        acc.sum_ms += millis;
        acc.max_ms = acc.max_ms.max(millis);
    }

    /// Renders the Prometheus text exposition format. Series are sorted by
    /// label so the output is stable across scrapes.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP saferun_requests_total Requests count\n");
        out.push_str("# TYPE saferun_requests_total counter\n");
        let mut requests: Vec<(String, String, u64)> = self
            .requests
            .read()
            .iter()
            .map(|((provider, action), count)| {
                (provider.clone(), action.clone(), count.load(Ordering::Relaxed))
            })
            .collect();
        requests.sort();
        for (provider, action, count) in requests {
            out.push_str(&format!(
                "saferun_requests_total{{provider=\"{provider}\",action=\"{action}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP saferun_changes_total Changes by status\n");
        out.push_str("# TYPE saferun_changes_total counter\n");
        let mut changes: Vec<(String, u64)> = self
            .changes
            .read()
            .iter()
            .map(|(status, count)| (status.clone(), count.load(Ordering::Relaxed)))
            .collect();
        changes.sort();
        for (status, count) in changes {
            out.push_str(&format!(
                "saferun_changes_total{{status=\"{status}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP saferun_notify_deliveries_total Notification deliveries\n");
        out.push_str("# TYPE saferun_notify_deliveries_total counter\n");
        let mut deliveries: Vec<(String, String, u64)> = self
            .deliveries
            .read()
            .iter()
            .map(|((channel, outcome), count)| {
                (channel.clone(), outcome.clone(), count.load(Ordering::Relaxed))
            })
            .collect();
        deliveries.sort();
        for (channel, outcome, count) in deliveries {
            out.push_str(&format!(
                "saferun_notify_deliveries_total{{channel=\"{channel}\",outcome=\"{outcome}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP saferun_latency_ms Operation latency in milliseconds\n");
        out.push_str("# TYPE saferun_latency_ms summary\n");
        let mut latencies: Vec<(String, u64, u64, u64)> = self
            .latencies
            .read()
            .iter()
            .map(|(action, acc)| (action.clone(), acc.count, acc.sum_ms, acc.max_ms))
            .collect();
        latencies.sort();
        for (action, count, sum_ms, max_ms) in latencies {
            out.push_str(&format!(
                "saferun_latency_ms_count{{action=\"{action}\"}} {count}\n"
            ));
            out.push_str(&format!(
                "saferun_latency_ms_sum{{action=\"{action}\"}} {sum_ms}\n"
            ));
            out.push_str(&format!(
                "saferun_latency_ms_max{{action=\"{action}\"}} {max_ms}\n"
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.record_request("github", "dryrun");
        registry.record_request("github", "dryrun");
        registry.record_change_status("applied");
        registry.record_delivery("slack_bot", true);
        registry.record_delivery("slack_bot", false);

        let text = registry.render_prometheus();
        assert!(text.contains("saferun_requests_total{provider=\"github\",action=\"dryrun\"} 2"));
        assert!(text.contains("saferun_changes_total{status=\"applied\"} 1"));
        assert!(text.contains("saferun_notify_deliveries_total{channel=\"slack_bot\",outcome=\"ok\"} 1"));
        assert!(text.contains("saferun_notify_deliveries_total{channel=\"slack_bot\",outcome=\"error\"} 1"));
    }

    #[test]
    fn test_latency_summary() {
        let registry = MetricsRegistry::new();
        registry.observe_latency("apply", 120);
        registry.observe_latency("apply", 80);

        let text = registry.render_prometheus();
        assert!(text.contains("saferun_latency_ms_count{action=\"apply\"} 2"));
        assert!(text.contains("saferun_latency_ms_sum{action=\"apply\"} 200"));
        assert!(text.contains("saferun_latency_ms_max{action=\"apply\"} 120"));
    }

    #[test]
    fn test_concurrent_increments_do_not_lose_counts() {
        use std::sync::Arc;
        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    registry.record_request("github", "dryrun");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let text = registry.render_prometheus();
        assert!(text.contains("saferun_requests_total{provider=\"github\",action=\"dryrun\"} 800"));
    }
}
