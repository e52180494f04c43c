#![forbid(unsafe_code)]

// Signaling metrics — lock-free counters plus a request-latency histogram,
// rendered in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Request-latency bucket upper bounds, microseconds.
const LATENCY_BOUNDS_US: [u64; 8] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000,
];

const LATENCY_LABELS: [&str; 8] = [
    "0.001", "0.005", "0.01", "0.05", "0.1", "0.5", "1", "5",
];

struct Counters {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    requests_total: AtomicU64,
    request_errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    peers_joined_total: AtomicU64,
    peers_left_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    notifications_dropped_total: AtomicU64,

    // Cumulative histogram of request handling latency.
    latency_buckets: [AtomicU64; 8],
    latency_count: AtomicU64,
    latency_sum_us: AtomicU64,
}

/// Cheap-to-clone handle over process-wide signaling metrics.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                connections_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                requests_total: AtomicU64::new(0),
                request_errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                peers_joined_total: AtomicU64::new(0),
                peers_left_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                notifications_dropped_total: AtomicU64::new(0),
                latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
                latency_count: AtomicU64::new(0),
                latency_sum_us: AtomicU64::new(0),
            }),
        }
    }

    /// Counts a new connection and returns a guard that keeps the active
    /// gauge consistent even if the connection handler panics.
    pub fn connection_opened(&self) -> ConnectionGuard {
        self.inner.connections_total.fetch_add(1, Relaxed);
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn request_handled(&self, elapsed: Duration, failed: bool) {
        let inner = &self.inner;
        inner.requests_total.fetch_add(1, Relaxed);
        if failed {
            inner.request_errors_total.fetch_add(1, Relaxed);
        }

        let us = elapsed.as_micros() as u64;
        inner.latency_sum_us.fetch_add(us, Relaxed);
        inner.latency_count.fetch_add(1, Relaxed);
        for (bucket, bound) in inner.latency_buckets.iter().zip(LATENCY_BOUNDS_US) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    pub fn room_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn peer_joined(&self) {
        self.inner.peers_joined_total.fetch_add(1, Relaxed);
    }

    pub fn peer_left(&self) {
        self.inner.peers_left_total.fetch_add(1, Relaxed);
    }

    pub fn producer_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn consumer_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn notification_dropped(&self) {
        self.inner.notifications_dropped_total.fetch_add(1, Relaxed);
    }

    /// Renders every metric. Room/peer gauges are sampled by the caller since
    /// they live in the registry, not here.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(2048);
        let i = &self.inner;

        counter(&mut out, "conclave_connections_total", "Signaling connections accepted", i.connections_total.load(Relaxed));
        counter(&mut out, "conclave_requests_total", "Requests handled", i.requests_total.load(Relaxed));
        counter(&mut out, "conclave_request_errors_total", "Requests acknowledged with an error", i.request_errors_total.load(Relaxed));
        counter(&mut out, "conclave_rooms_created_total", "Rooms created", i.rooms_created_total.load(Relaxed));
        counter(&mut out, "conclave_peers_joined_total", "Peers joined", i.peers_joined_total.load(Relaxed));
        counter(&mut out, "conclave_peers_left_total", "Peers torn down", i.peers_left_total.load(Relaxed));
        counter(&mut out, "conclave_producers_created_total", "Producers created", i.producers_created_total.load(Relaxed));
        counter(&mut out, "conclave_consumers_created_total", "Consumers created", i.consumers_created_total.load(Relaxed));
        counter(&mut out, "conclave_notifications_dropped_total", "Event emissions dropped on full or closed channels", i.notifications_dropped_total.load(Relaxed));

        gauge(&mut out, "conclave_connections_active", "Open signaling connections", i.connections_active.load(Relaxed));
        gauge(&mut out, "conclave_rooms_active", "Live rooms", rooms_active as u64);
        gauge(&mut out, "conclave_peers_active", "Live peers across all rooms", peers_active as u64);

        let name = "conclave_request_seconds";
        let _ = writeln!(out, "# HELP {name} Request handling latency in seconds");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (label, bucket) in LATENCY_LABELS.iter().zip(&i.latency_buckets) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = i.latency_count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = i.latency_sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active-connection gauge on drop.
pub struct ConnectionGuard {
    inner: Arc<Counters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_gauge_tracks_guard_lifetime() {
        let metrics = Metrics::new();
        let guard = metrics.connection_opened();
        let rendered = metrics.render_prometheus(0, 0);
        assert!(rendered.contains("conclave_connections_active 1"));
        drop(guard);
        let rendered = metrics.render_prometheus(0, 0);
        assert!(rendered.contains("conclave_connections_active 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.request_handled(Duration::from_millis(2), false);
        metrics.request_handled(Duration::from_millis(20), true);
        let rendered = metrics.render_prometheus(0, 0);
        assert!(rendered.contains("conclave_request_seconds_bucket{le=\"0.005\"} 1"));
        assert!(rendered.contains("conclave_request_seconds_bucket{le=\"0.05\"} 2"));
        assert!(rendered.contains("conclave_request_seconds_count 2"));
        assert!(rendered.contains("conclave_request_errors_total 1"));
    }
}
