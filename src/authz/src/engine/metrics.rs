//! Engine metrics with Prometheus text exposition
//!
//! Counters are plain atomics. Latency percentiles come from a fixed-size
//! ring of recent samples, so memory stays bounded no matter how long the
//! engine runs.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::DecisionEffect;

const LATENCY_RING_CAPACITY: usize = 4096;

/// Engine metrics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    /// Total number of authorization requests decided
    pub total_requests: u64,

    /// Number of allowed decisions
    pub allowed_decisions: u64,

    /// Number of denied decisions
    pub denied_decisions: u64,

    /// Number of decisions that ended in an evaluation error
    pub error_decisions: u64,

    /// Decision cache hits
    pub cache_hits: u64,

    /// Decision cache misses
    pub cache_misses: u64,

    /// Policy evaluations that failed over to role evaluation
    pub policy_fallbacks: u64,

    /// Audit records dropped because the queue was full
    pub audit_dropped: u64,

    /// Latency percentiles over recent requests
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p99_ms: f64,

    /// Average latency over recent requests
    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    /// Calculate cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }
}

/// Fixed-capacity ring of latency samples
struct LatencyRing {
    samples: Vec<f64>,
    next: usize,
}

impl LatencyRing {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(LATENCY_RING_CAPACITY),
            next: 0,
        }
    }

    fn record(&mut self, sample: f64) {
        if self.samples.len() < LATENCY_RING_CAPACITY {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % LATENCY_RING_CAPACITY;
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }
}

/// Metrics collector
pub struct MetricsCollector {
    total_requests: AtomicU64,
    allowed_decisions: AtomicU64,
    denied_decisions: AtomicU64,
    error_decisions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    policy_fallbacks: AtomicU64,
    audit_dropped: AtomicU64,
    latencies: Mutex<LatencyRing>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            allowed_decisions: AtomicU64::new(0),
            denied_decisions: AtomicU64::new(0),
            error_decisions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            policy_fallbacks: AtomicU64::new(0),
            audit_dropped: AtomicU64::new(0),
            latencies: Mutex::new(LatencyRing::new()),
        }
    }

    /// Record a decision outcome
    pub fn record_decision(&self, effect: DecisionEffect) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match effect {
            DecisionEffect::Allow => self.allowed_decisions.fetch_add(1, Ordering::Relaxed),
            DecisionEffect::Deny => self.denied_decisions.fetch_add(1, Ordering::Relaxed),
            DecisionEffect::Error => self.error_decisions.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a policy evaluation failure that fell back to roles
    pub fn record_policy_fallback(&self) {
        self.policy_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an audit record dropped under queue pressure
    pub fn record_audit_drop(&self) {
        self.audit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record request latency
    pub fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.latencies.lock().record(latency_ms);
    }

    /// Current metrics snapshot
    pub fn snapshot(&self) -> EngineMetrics {
        let sorted = self.latencies.lock().sorted();
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        EngineMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed_decisions: self.allowed_decisions.load(Ordering::Relaxed),
            denied_decisions: self.denied_decisions.load(Ordering::Relaxed),
            error_decisions: self.error_decisions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            policy_fallbacks: self.policy_fallbacks.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
            latency_p50_ms: percentile(&sorted, 0.50),
            latency_p90_ms: percentile(&sorted, 0.90),
            latency_p99_ms: percentile(&sorted, 0.99),
            avg_latency_ms: avg,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.allowed_decisions.store(0, Ordering::Relaxed);
        self.denied_decisions.store(0, Ordering::Relaxed);
        self.error_decisions.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.policy_fallbacks.store(0, Ordering::Relaxed);
        self.audit_dropped.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let metrics = self.snapshot();

        format!(
            r#"# HELP authz_requests_total Total number of authorization requests
# TYPE authz_requests_total counter
authz_requests_total {}

# HELP authz_allowed_total Number of allowed decisions
# TYPE authz_allowed_total counter
authz_allowed_total {}

# HELP authz_denied_total Number of denied decisions
# TYPE authz_denied_total counter
authz_denied_total {}

# HELP authz_errors_total Number of error decisions
# TYPE authz_errors_total counter
authz_errors_total {}

# HELP authz_cache_hits_total Decision cache hits
# TYPE authz_cache_hits_total counter
authz_cache_hits_total {}

# HELP authz_cache_misses_total Decision cache misses
# TYPE authz_cache_misses_total counter
authz_cache_misses_total {}

# HELP authz_policy_fallbacks_total Policy evaluations that fell back to role evaluation
# TYPE authz_policy_fallbacks_total counter
authz_policy_fallbacks_total {}

# HELP authz_audit_dropped_total Audit records dropped under queue pressure
# TYPE authz_audit_dropped_total counter
authz_audit_dropped_total {}

# HELP authz_latency_seconds Request latency percentiles
# TYPE authz_latency_seconds summary
authz_latency_seconds{{quantile="0.5"}} {}
authz_latency_seconds{{quantile="0.9"}} {}
authz_latency_seconds{{quantile="0.99"}} {}
"#,
            metrics.total_requests,
            metrics.allowed_decisions,
            metrics.denied_decisions,
            metrics.error_decisions,
            metrics.cache_hits,
            metrics.cache_misses,
            metrics.policy_fallbacks,
            metrics.audit_dropped,
            metrics.latency_p50_ms / 1000.0,
            metrics.latency_p90_ms / 1000.0,
            metrics.latency_p99_ms / 1000.0,
        )
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Calculate percentile from sorted data
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let idx = ((sorted.len() as f64) * p) as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decisions_by_effect() {
        let collector = MetricsCollector::new();

        collector.record_decision(DecisionEffect::Allow);
        collector.record_decision(DecisionEffect::Allow);
        collector.record_decision(DecisionEffect::Deny);
        collector.record_decision(DecisionEffect::Error);

        let metrics = collector.snapshot();
        assert_eq!(metrics.total_requests, 4);
        assert_eq!(metrics.allowed_decisions, 2);
        assert_eq!(metrics.denied_decisions, 1);
        assert_eq!(metrics.error_decisions, 1);
        assert!((metrics.allow_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_record_cache() {
        let collector = MetricsCollector::new();

        collector.record_cache_hit();
        collector.record_cache_hit();
        collector.record_cache_miss();

        let metrics = collector.snapshot();
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.cache_misses, 1);
        assert!((metrics.cache_hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_record_latency_percentiles() {
        let collector = MetricsCollector::new();

        for ms in [5u64, 10, 15] {
            collector.record_latency(Duration::from_millis(ms));
        }

        let metrics = collector.snapshot();
        assert!((metrics.avg_latency_ms - 10.0).abs() < 1.0);
        assert!(metrics.latency_p50_ms > 0.0);
        assert!(metrics.latency_p99_ms >= metrics.latency_p50_ms);
    }

    #[test]
    fn test_latency_ring_stays_bounded() {
        let collector = MetricsCollector::new();

        for i in 0..(LATENCY_RING_CAPACITY + 500) {
            collector.record_latency(Duration::from_micros(i as u64));
        }

        let ring = collector.latencies.lock();
        assert_eq!(ring.samples.len(), LATENCY_RING_CAPACITY);
    }

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new();

        collector.record_decision(DecisionEffect::Allow);
        collector.record_latency(Duration::from_millis(5));
        collector.record_policy_fallback();

        let prometheus = collector.export_prometheus();
        assert!(prometheus.contains("authz_requests_total 1"));
        assert!(prometheus.contains("authz_allowed_total 1"));
        assert!(prometheus.contains("authz_policy_fallbacks_total 1"));
        assert!(prometheus.contains(r#"authz_latency_seconds{quantile="0.5"}"#));
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();

        collector.record_decision(DecisionEffect::Allow);
        collector.record_cache_hit();
        collector.record_latency(Duration::from_millis(2));

        collector.reset();

        let metrics = collector.snapshot();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.cache_hits, 0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
    }
}
