use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;

use crate::circuit_breaker::{CircuitRecord, CircuitState};

const RESERVOIR_SIZE: usize = 512;

/// Process-local counters and latency reservoirs. Scraping endpoints read
/// a snapshot; nothing here touches the shared store.
#[derive(Default)]
pub struct MetricsRegistry {
    routes: DashMap<String, Arc<RouteMetrics>>,
    rate_limited_total: AtomicU64,
    breaker_rejected_total: AtomicU64,
    limiter_fail_open_total: AtomicU64,
    store_errors_total: AtomicU64,
    auth_failures_total: AtomicU64,
}

#[derive(Default)]
struct RouteMetrics {
    // Status classes 1xx..5xx.
    classes: [AtomicU64; 5],
    latency: Mutex<LatencyReservoir>,
}

/// Fixed-size ring of recent latency samples in microseconds; percentiles
/// are computed over a sorted copy at snapshot time.
struct LatencyReservoir {
    samples: Vec<u64>,
    index: usize,
    filled: bool,
}

impl Default for LatencyReservoir {
    fn default() -> Self {
        Self {
            samples: vec![0; RESERVOIR_SIZE],
            index: 0,
            filled: false,
        }
    }
}

impl LatencyReservoir {
    fn add(&mut self, latency_us: u64) {
        self.samples[self.index] = latency_us;
        self.index = (self.index + 1) % self.samples.len();
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn summary(&self) -> LatencySummary {
        let count = if self.filled {
            self.samples.len()
        } else {
            self.index
        };
        if count == 0 {
            return LatencySummary::default();
        }

        let mut sorted: Vec<u64> = self.samples[..count].to_vec();
        sorted.sort_unstable();

        let percentile = |p: f64| -> f64 {
            let idx = ((count as f64 * p) as usize).min(count - 1);
            sorted[idx] as f64 / 1_000.0
        };
        let avg = sorted.iter().sum::<u64>() as f64 / count as f64 / 1_000.0;

        LatencySummary {
            samples: count as u64,
            avg_ms: avg,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub gateway: GatewayCounters,
    pub routes: BTreeMap<String, RouteSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct GatewayCounters {
    pub rate_limited_total: u64,
    pub breaker_rejected_total: u64,
    pub limiter_fail_open_total: u64,
    pub store_errors_total: u64,
    pub auth_failures_total: u64,
}

#[derive(Debug, Serialize)]
pub struct RouteSnapshot {
    pub requests: BTreeMap<String, u64>,
    pub latency: LatencySummary,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, route: &str) -> Arc<RouteMetrics> {
        self.routes
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(RouteMetrics::default()))
            .clone()
    }

    pub fn record_proxied(&self, route: &str, status: u16, latency: Duration) {
        let metrics = self.route(route);
        let class = (status / 100) as usize;
        if (1..=5).contains(&class) {
            metrics.classes[class - 1].fetch_add(1, Ordering::Relaxed);
        }
        let mut reservoir = metrics
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reservoir.add(latency.as_micros() as u64);
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_breaker_rejected(&self) {
        self.breaker_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_limiter_fail_open(&self) {
        self.limiter_fail_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_store_errors(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_auth_failures(&self) {
        self.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut routes = BTreeMap::new();
        for entry in self.routes.iter() {
            let mut requests = BTreeMap::new();
            for (idx, counter) in entry.value().classes.iter().enumerate() {
                let count = counter.load(Ordering::Relaxed);
                if count > 0 {
                    requests.insert(format!("{}xx", idx + 1), count);
                }
            }
            let latency = entry
                .value()
                .latency
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .summary();
            routes.insert(entry.key().clone(), RouteSnapshot { requests, latency });
        }

        MetricsSnapshot {
            gateway: GatewayCounters {
                rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
                breaker_rejected_total: self.breaker_rejected_total.load(Ordering::Relaxed),
                limiter_fail_open_total: self.limiter_fail_open_total.load(Ordering::Relaxed),
                store_errors_total: self.store_errors_total.load(Ordering::Relaxed),
                auth_failures_total: self.auth_failures_total.load(Ordering::Relaxed),
            },
            routes,
        }
    }

    pub fn render_prometheus(&self, circuits: &[(String, CircuitRecord)]) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str("# TYPE gateway_requests_total counter\n");
        for (route, route_snapshot) in &snapshot.routes {
            for (class, count) in &route_snapshot.requests {
                out.push_str(&format!(
                    "gateway_requests_total{{route=\"{route}\",class=\"{class}\"}} {count}\n"
                ));
            }
        }

        out.push_str("# TYPE gateway_rate_limited_total counter\n");
        out.push_str(&format!(
            "gateway_rate_limited_total {}\n",
            snapshot.gateway.rate_limited_total
        ));
        out.push_str("# TYPE gateway_breaker_rejected_total counter\n");
        out.push_str(&format!(
            "gateway_breaker_rejected_total {}\n",
            snapshot.gateway.breaker_rejected_total
        ));
        out.push_str("# TYPE gateway_limiter_fail_open_total counter\n");
        out.push_str(&format!(
            "gateway_limiter_fail_open_total {}\n",
            snapshot.gateway.limiter_fail_open_total
        ));
        out.push_str("# TYPE gateway_store_errors_total counter\n");
        out.push_str(&format!(
            "gateway_store_errors_total {}\n",
            snapshot.gateway.store_errors_total
        ));
        out.push_str("# TYPE gateway_auth_failures_total counter\n");
        out.push_str(&format!(
            "gateway_auth_failures_total {}\n",
            snapshot.gateway.auth_failures_total
        ));

        out.push_str("# TYPE gateway_latency_ms gauge\n");
        for (route, route_snapshot) in &snapshot.routes {
            let latency = &route_snapshot.latency;
            for (quantile, value) in [
                ("0.5", latency.p50_ms),
                ("0.95", latency.p95_ms),
                ("0.99", latency.p99_ms),
            ] {
                out.push_str(&format!(
                    "gateway_latency_ms{{route=\"{route}\",quantile=\"{quantile}\"}} {value:.2}\n"
                ));
            }
        }

        out.push_str("# HELP gateway_circuit_state 0=closed, 1=open, 2=half_open\n");
        out.push_str("# TYPE gateway_circuit_state gauge\n");
        for (service, record) in circuits {
            let value = match record.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            out.push_str(&format!(
                "gateway_circuit_state{{service=\"{service}\"}} {value}\n"
            ));
        }
        out.push_str("# TYPE gateway_circuit_failures gauge\n");
        for (service, record) in circuits {
            out.push_str(&format!(
                "gateway_circuit_failures{{service=\"{service}\"}} {}\n",
                record.consecutive_failures
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_known_distribution() {
        let mut reservoir = LatencyReservoir::default();
        // 1ms..100ms in microseconds.
        for ms in 1..=100u64 {
            reservoir.add(ms * 1_000);
        }

        let summary = reservoir.summary();
        assert_eq!(summary.samples, 100);
        assert!((summary.p50_ms - 51.0).abs() <= 1.0);
        assert!((summary.p95_ms - 96.0).abs() <= 1.0);
        assert!((summary.p99_ms - 100.0).abs() <= 1.0);
    }

    #[test]
    fn reservoir_is_bounded() {
        let mut reservoir = LatencyReservoir::default();
        for i in 0..(RESERVOIR_SIZE as u64 * 3) {
            reservoir.add(i);
        }
        assert_eq!(reservoir.summary().samples, RESERVOIR_SIZE as u64);
    }

    #[test]
    fn snapshot_counts_status_classes() {
        let registry = MetricsRegistry::new();
        registry.record_proxied("users", 200, Duration::from_millis(5));
        registry.record_proxied("users", 204, Duration::from_millis(5));
        registry.record_proxied("users", 502, Duration::from_millis(5));
        registry.incr_rate_limited();

        let snapshot = registry.snapshot();
        let users = snapshot.routes.get("users").unwrap();
        assert_eq!(users.requests.get("2xx"), Some(&2));
        assert_eq!(users.requests.get("5xx"), Some(&1));
        assert_eq!(snapshot.gateway.rate_limited_total, 1);
    }

    #[test]
    fn prometheus_rendering_includes_circuits() {
        let registry = MetricsRegistry::new();
        registry.record_proxied("users", 200, Duration::from_millis(3));

        let circuits = vec![(
            "users".to_string(),
            CircuitRecord {
                state: CircuitState::Open,
                consecutive_failures: 5,
                ..CircuitRecord::default()
            },
        )];
        let text = registry.render_prometheus(&circuits);

        assert!(text.contains("gateway_requests_total{route=\"users\",class=\"2xx\"} 1"));
        assert!(text.contains("gateway_circuit_state{service=\"users\"} 1"));
        assert!(text.contains("gateway_circuit_failures{service=\"users\"} 5"));
    }
}
