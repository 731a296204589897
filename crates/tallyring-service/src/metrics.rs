//! Lightweight Prometheus-compatible metrics using atomic counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ip_quota::Decision;
use crate::qps::{QpsReport, RecordOutcome};

/// Counters for both policies, shared by the request hooks and the report
/// sink wrapper.
pub struct Metrics {
    qps_recorded_total: AtomicU64,
    qps_dropped_total: AtomicU64,
    quota_allowed_total: AtomicU64,
    quota_denied_total: AtomicU64,
    reports_total: AtomicU64,
    last_report_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            qps_recorded_total: AtomicU64::new(0),
            qps_dropped_total: AtomicU64::new(0),
            quota_allowed_total: AtomicU64::new(0),
            quota_denied_total: AtomicU64::new(0),
            reports_total: AtomicU64::new(0),
            last_report_total: AtomicU64::new(0),
        }
    }

    pub fn record_outcome(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Recorded => &self.qps_recorded_total,
            RecordOutcome::Dropped => &self.qps_dropped_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, decision: Decision) {
        let counter = match decision {
            Decision::Allow => &self.quota_allowed_total,
            Decision::Deny => &self.quota_denied_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report(&self, report: &QpsReport) {
        self.reports_total.fetch_add(1, Ordering::Relaxed);
        self.last_report_total.store(report.total, Ordering::Relaxed);
    }

    pub fn quota_denied_total(&self) -> u64 {
        self.quota_denied_total.load(Ordering::Relaxed)
    }

    pub fn reports_total(&self) -> u64 {
        self.reports_total.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self, current_bucket: usize, uptime_seconds: u64) -> String {
        let mut out = String::with_capacity(1024);

        counter(
            &mut out,
            "tallyring_qps_recorded_total",
            "Requests counted by the QPS reporter",
            self.qps_recorded_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "tallyring_qps_dropped_total",
            "Increments dropped because the QPS queue was full",
            self.qps_dropped_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "tallyring_quota_allowed_total",
            "Requests admitted by the IP quota guard",
            self.quota_allowed_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "tallyring_quota_denied_total",
            "Requests rejected by the IP quota guard",
            self.quota_denied_total(),
        );
        counter(
            &mut out,
            "tallyring_reports_total",
            "QPS reports handed to the sink",
            self.reports_total(),
        );

        gauge(
            &mut out,
            "tallyring_last_report_requests",
            "Requests in the most recent QPS report",
            self.last_report_total.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "tallyring_qps_current_bucket",
            "Ring slot currently absorbing QPS increments",
            current_bucket,
        );
        gauge(
            &mut out,
            "tallyring_uptime_seconds",
            "Server uptime in seconds",
            uptime_seconds,
        );

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} counter").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} gauge").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}
