//! Tallyring Server - HTTP server wiring the rotating-window counters.
//!
//! The counting core lives in `tallyring-service`, the axum hooks in
//! `tallyring-http`. This crate adds configuration and the default report
//! sink.

pub mod config;

pub use tallyring_http::{AppState, router};

use tallyring_service::qps::QpsReport;

/// Default report sink: one log event per report, one per endpoint.
pub fn log_report(report: QpsReport) {
    if report.total == 0 {
        tracing::debug!(epoch = report.epoch, "idle QPS window");
        return;
    }

    let interval = report.interval();
    tracing::info!(
        epoch = report.epoch,
        bucket = report.bucket,
        total = report.total,
        qps = report.qps(),
        "QPS report"
    );
    for record in &report.records {
        tracing::info!(
            endpoint = %record.path,
            count = record.count,
            per_second = record.per_second(interval),
            "endpoint QPS"
        );
    }
}
