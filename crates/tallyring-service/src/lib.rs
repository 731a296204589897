//! Tallyring Service: rotating-window request accounting.
//!
//! This crate contains all transport-agnostic logic:
//! - [`ring::RotatingCounter`], a fixed ring of `key -> count` buckets whose
//!   current slot advances on a timer,
//! - [`qps::QpsReporter`], which harvests each vacated bucket into a
//!   per-endpoint report for a host-supplied sink,
//! - [`ip_quota::IpQuotaGuard`], which caps requests per client within the
//!   current bucket and resets on rotation,
//! - metrics and the shared [`ServiceState`] handle.
//!
//! **Zero transport dependencies**. The HTTP adapter lives in `tallyring-http`.

pub mod error;
pub mod ip_quota;
pub mod metrics;
pub mod qps;
pub mod ring;
pub mod rotation;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use error::ServiceError;
use ip_quota::{Decision, IpQuotaGuard, QuotaRule};
use metrics::Metrics;
use qps::{QpsConfig, QpsReport, QpsReporter, RecordOutcome, ReportSink};
use rotation::TaskHandle;

/// Configuration for both policies.
///
/// Transport-specific config (bind address, proxy trust) stays in the
/// binary crate's `Config` struct.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub qps: QpsConfig,
    /// Quota rules enforced together. Empty disables the guard.
    pub quota_rules: Vec<QuotaRule>,
    pub quota_ring_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            qps: QpsConfig::default(),
            quota_rules: vec![QuotaRule::new(Duration::from_secs(60), 200)],
            quota_ring_size: 16,
        }
    }
}

/// Shared service state, cloneable across request hooks and background
/// tasks.
///
/// Constructed once by the host; there is no process-wide instance.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<Inner>,
}

struct Inner {
    qps: QpsReporter,
    quota: IpQuotaGuard,
    metrics: Metrics,
    last_report: Mutex<Option<QpsReport>>,
    start_time: Instant,
}

impl ServiceState {
    /// Builds both policies. Fails on invalid ring sizes, intervals or rules.
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            inner: Arc::new(Inner {
                qps: QpsReporter::new(config.qps.clone())?,
                quota: IpQuotaGuard::new(config.quota_rules.clone(), config.quota_ring_size)?,
                metrics: Metrics::new(),
                last_report: Mutex::new(None),
                start_time: Instant::now(),
            }),
        })
    }

    // --- Accessors ---

    pub fn qps(&self) -> &QpsReporter {
        &self.inner.qps
    }

    pub fn quota(&self) -> &IpQuotaGuard {
        &self.inner.quota
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Most recent report handed to the sink, if any.
    pub fn last_report(&self) -> Option<QpsReport> {
        self.inner.last_report.lock().clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    // --- Request path ---

    /// Counts one request for the QPS report.
    pub async fn record_request(&self, method: &str, path: &str) -> RecordOutcome {
        let outcome = self.inner.qps.record(method, path).await;
        self.inner.metrics.record_outcome(outcome);
        outcome
    }

    /// Runs the quota check for `client`.
    pub fn check_client(&self, client: &str) -> Decision {
        let decision = self.inner.quota.check(client);
        self.inner.metrics.record_decision(decision);
        decision
    }

    // --- Background ---

    /// Starts the rotation tasks of both policies.
    ///
    /// Every report is recorded in metrics and kept as [`last_report`]
    /// before being passed on to `sink`.
    ///
    /// [`last_report`]: Self::last_report
    pub fn start<S: ReportSink>(
        &self,
        sink: S,
        shutdown: CancellationToken,
    ) -> Result<TaskHandle, ServiceError> {
        let quota_shutdown = shutdown.child_token();
        let quota = self.inner.quota.start(quota_shutdown.clone())?;

        let state = self.clone();
        let started = self.inner.qps.start(
            move |report: QpsReport| {
                state.inner.metrics.record_report(&report);
                *state.inner.last_report.lock() = Some(report.clone());
                sink.report(report);
            },
            shutdown,
        );
        let mut handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                quota_shutdown.cancel();
                return Err(e);
            }
        };
        handle.merge(quota);
        Ok(handle)
    }

    /// Prometheus text exposition of all counters.
    pub fn render_metrics(&self) -> String {
        self.inner
            .metrics
            .render(self.inner.qps.ring().current_index(), self.uptime_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qps::QpsStrategy;
    use tokio::time;

    fn config(max: u64) -> ServiceConfig {
        ServiceConfig {
            qps: QpsConfig {
                interval: Duration::from_secs(1),
                ring_size: 4,
                strategy: QpsStrategy::Locked,
            },
            quota_rules: vec![QuotaRule::new(Duration::from_secs(10), max)],
            quota_ring_size: 4,
        }
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut bad = config(5);
        bad.qps.ring_size = 1;
        assert!(ServiceState::new(&bad).is_err());

        let mut bad = config(5);
        bad.quota_rules = vec![QuotaRule::new(Duration::from_secs(10), 0)];
        assert!(ServiceState::new(&bad).is_err());
    }

    #[test]
    fn check_client_counts_decisions() {
        let state = ServiceState::new(&config(1)).unwrap();
        assert!(state.check_client("1.2.3.4").is_allowed());
        assert!(!state.check_client("1.2.3.4").is_allowed());
        assert_eq!(state.metrics().quota_denied_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_tracks_last_report() {
        let state = ServiceState::new(&config(5)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let handle = state
            .start(
                move |report: QpsReport| sink_seen.lock().push(report.total),
                CancellationToken::new(),
            )
            .unwrap();
        // One QPS rotation, one harvester, one quota rotation.
        assert_eq!(handle.task_count(), 3);
        assert!(state.last_report().is_none());

        state.record_request("GET", "/a").await;
        state.record_request("GET", "/a").await;
        time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(state.last_report().map(|r| r.total), Some(2));
        assert_eq!(state.metrics().reports_total(), 1);
        assert!(state.render_metrics().contains("tallyring_last_report_requests 2\n"));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_leaves_no_quota_rotation_running() {
        let state = ServiceState::new(&config(1)).unwrap();
        let qps = state
            .qps()
            .start(|_: QpsReport| {}, CancellationToken::new())
            .unwrap();
        assert!(matches!(
            state.start(|_: QpsReport| {}, CancellationToken::new()),
            Err(ServiceError::AlreadyStarted)
        ));

        // A live quota rotation would reopen the window after 10s.
        assert!(state.check_client("10.0.0.1").is_allowed());
        time::sleep(Duration::from_secs(25)).await;
        assert!(!state.check_client("10.0.0.1").is_allowed());

        qps.shutdown().await;
    }
}
