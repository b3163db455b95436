//! Simple metrics collection for observability
//!
//! Lightweight atomic counters for admission outcomes and request latency,
//! plus per-controller occupancy gauges read from the flow chain at export
//! time.

use flowgate::ControllerStatus;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// How a request left the flow control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Admitted and processed
    Admitted,
    /// Waited its whole budget in a queue (503)
    TimedOut,
    /// Over a rate limit that rejects excess requests (429)
    Rejected,
    /// Client address blacklisted (403)
    Blacklisted,
}

/// Core metrics collected by the server
pub struct Metrics {
    /// Server start time
    start_time: Instant,

    /// Total OWS requests received
    pub total_requests: AtomicU64,

    /// Admission outcomes
    pub requests_admitted: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub requests_blacklisted: AtomicU64,

    /// Admitted requests the upstream failed to answer
    pub upstream_errors: AtomicU64,

    /// Request latency buckets, admission wait included
    pub latency_under_1ms: AtomicU64,
    pub latency_under_10ms: AtomicU64,
    pub latency_under_100ms: AtomicU64,
    pub latency_under_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    /// Histogram support
    pub latency_sum_micros: AtomicU64,
    pub latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            requests_admitted: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_blacklisted: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            latency_under_1ms: AtomicU64::new(0),
            latency_under_10ms: AtomicU64::new(0),
            latency_under_100ms: AtomicU64::new(0),
            latency_under_1s: AtomicU64::new(0),
            latency_over_1s: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    /// Record a finished request and its latency
    pub fn record_request(&self, outcome: Outcome, latency_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::Admitted => self.requests_admitted.fetch_add(1, Ordering::Relaxed),
            Outcome::TimedOut => self.requests_timed_out.fetch_add(1, Ordering::Relaxed),
            Outcome::Rejected => self.requests_rejected.fetch_add(1, Ordering::Relaxed),
            Outcome::Blacklisted => self.requests_blacklisted.fetch_add(1, Ordering::Relaxed),
        };

        match latency_us {
            0..=999 => self.latency_under_1ms.fetch_add(1, Ordering::Relaxed),
            1000..=9999 => self.latency_under_10ms.fetch_add(1, Ordering::Relaxed),
            10000..=99999 => self.latency_under_100ms.fetch_add(1, Ordering::Relaxed),
            100000..=999999 => self.latency_under_1s.fetch_add(1, Ordering::Relaxed),
            _ => self.latency_over_1s.fetch_add(1, Ordering::Relaxed),
        };

        self.latency_sum_micros
            .fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, controllers: &[ControllerStatus]) -> String {
        let mut output = String::with_capacity(2048 + controllers.len() * 256);
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        push_metric(
            &mut output,
            "flowgate_uptime_seconds",
            "gauge",
            "Time since server start in seconds",
            self.uptime_seconds(),
        );
        push_metric(
            &mut output,
            "flowgate_requests_total",
            "counter",
            "Total number of OWS requests received",
            load(&self.total_requests),
        );

        output.push_str("# HELP flowgate_requests_by_outcome Requests by admission outcome\n");
        output.push_str("# TYPE flowgate_requests_by_outcome counter\n");
        for (outcome, counter) in [
            ("admitted", &self.requests_admitted),
            ("timed_out", &self.requests_timed_out),
            ("rejected", &self.requests_rejected),
            ("blacklisted", &self.requests_blacklisted),
        ] {
            let _ = writeln!(
                output,
                "flowgate_requests_by_outcome{{outcome=\"{outcome}\"}} {}",
                load(counter)
            );
        }
        output.push('\n');

        push_metric(
            &mut output,
            "flowgate_upstream_errors",
            "counter",
            "Admitted requests the upstream failed to answer",
            load(&self.upstream_errors),
        );

        // Latency distribution
        let under_1ms = load(&self.latency_under_1ms);
        let under_10ms = under_1ms + load(&self.latency_under_10ms);
        let under_100ms = under_10ms + load(&self.latency_under_100ms);
        let under_1s = under_100ms + load(&self.latency_under_1s);
        output.push_str("# HELP flowgate_request_duration_bucket Request latency distribution\n");
        output.push_str("# TYPE flowgate_request_duration_bucket histogram\n");
        for (le, count) in [
            ("0.001", under_1ms),
            ("0.01", under_10ms),
            ("0.1", under_100ms),
            ("1", under_1s),
            ("+Inf", load(&self.latency_count)),
        ] {
            let _ = writeln!(
                output,
                "flowgate_request_duration_bucket{{le=\"{le}\"}} {count}"
            );
        }
        let latency_sum_seconds = load(&self.latency_sum_micros) as f64 / 1_000_000.0;
        let _ = writeln!(
            output,
            "flowgate_request_duration_sum {latency_sum_seconds:.6}"
        );
        let _ = writeln!(
            output,
            "flowgate_request_duration_count {}\n",
            load(&self.latency_count)
        );

        // Controller occupancy
        push_gauges(
            &mut output,
            "flowgate_controller_capacity",
            "Permits per gate (request limit for rate controllers)",
            controllers,
            |s| s.capacity,
        );
        push_gauges(
            &mut output,
            "flowgate_controller_running",
            "Requests currently holding a permit",
            controllers,
            |s| s.running,
        );
        push_gauges(
            &mut output,
            "flowgate_controller_queued",
            "Requests currently waiting",
            controllers,
            |s| s.queued,
        );
        push_gauges(
            &mut output,
            "flowgate_controller_keys",
            "Clients tracked by per-client controllers",
            controllers,
            |s| s.keys,
        );

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}\n");
}

/// One gauge line per controller, labelled by name and kind
fn push_gauges(
    output: &mut String,
    name: &str,
    help: &str,
    controllers: &[ControllerStatus],
    value: impl Fn(&ControllerStatus) -> usize,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    for status in controllers {
        let _ = writeln!(
            output,
            "{name}{{controller=\"{}\",kind=\"{}\"}} {}",
            escape_label(&status.name),
            status.kind,
            value(status)
        );
    }
    output.push('\n');
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
