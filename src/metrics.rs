#![forbid(unsafe_code)]

// Server metrics - atomic counters rendered as Prometheus text.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bounds of the latency buckets, in microseconds
const BUCKET_BOUNDS_US: [u64; 8] = [1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000];
const BUCKET_LABELS: [&str; 8] = ["0.001", "0.005", "0.01", "0.05", "0.1", "0.5", "1", "5"];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, &bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US.iter()) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide metrics. Cloning shares the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    program_switches_total: AtomicU64,
    unauthorized_total: AtomicU64,
    connections_active: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                program_switches_total: AtomicU64::new(0),
                unauthorized_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_program_switches(&self) {
        self.inner.program_switches_total.fetch_add(1, Relaxed);
    }

    pub fn inc_unauthorized(&self) {
        self.inner.unauthorized_total.fetch_add(1, Relaxed);
    }

    pub fn rooms_created(&self) -> u64 {
        self.inner.rooms_created_total.load(Relaxed)
    }

    pub fn unauthorized(&self) -> u64 {
        self.inner.unauthorized_total.load(Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    /// Counts a live connection until the guard drops
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Renders every metric. `rooms_active` and `program_live` are sampled by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, program_live: bool) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        let counters = [
            ("liveswitch_connections_total", "Total WebSocket connections", &i.connections_total),
            ("liveswitch_messages_received_total", "Total messages received from clients", &i.messages_received_total),
            ("liveswitch_messages_sent_total", "Total messages sent to clients", &i.messages_sent_total),
            ("liveswitch_errors_total", "Total error replies", &i.errors_total),
            ("liveswitch_rooms_created_total", "Total rooms created", &i.rooms_created_total),
            ("liveswitch_producers_created_total", "Total producers created", &i.producers_created_total),
            ("liveswitch_consumers_created_total", "Total consumers created", &i.consumers_created_total),
            ("liveswitch_program_switches_total", "Total program switches", &i.program_switches_total),
            ("liveswitch_unauthorized_total", "Total requests rejected for role", &i.unauthorized_total),
        ];
        for (name, help, counter) in counters {
            render_metric(&mut out, "counter", name, help, counter.load(Relaxed));
        }

        render_metric(
            &mut out,
            "gauge",
            "liveswitch_connections_active",
            "Currently open WebSocket connections",
            i.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "gauge", "liveswitch_rooms_active", "Rooms with a router", rooms_active as u64);
        render_metric(
            &mut out,
            "gauge",
            "liveswitch_program_live",
            "1 when a room is on program",
            u64::from(program_live),
        );

        i.message_handling.render(
            "liveswitch_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );
        out
    }
}

/// Decrements `connections_active` on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
