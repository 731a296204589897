//! Per-endpoint request counting with periodic harvest-and-report.
//!
//! Requests are counted under `method|path` keys in the current bucket of a
//! [`RotatingCounter`]. Once per interval the rotation task advances the ring
//! and hands the vacated slot to a harvester task, which drains it into a
//! [`QpsReport`] and passes it to the host's [`ReportSink`].
//!
//! The harvester runs each sink call on the blocking pool and waits for it
//! before taking the next slot, so reports stay in ring order and a slow sink
//! never holds up the rotation timer. A harvester that falls a full lap
//! behind loses the epochs it was lapped on: the rotation task clears each
//! slot before reopening it, and the harvester later skips those epochs.
//!
//! A panicking sink is not caught: the panic is resumed on the harvester,
//! the rotation task notices the closed hand-off on its next tick, logs an
//! error and exits, and no further reports are produced.

use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::ring::RotatingCounter;
use crate::rotation::{TaskHandle, spawn_rotation};

/// Request count for one `method|path` key over one bucket lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QpsInfo {
    pub path: String,
    pub count: u64,
}

impl QpsInfo {
    /// Average requests per second over `interval`.
    pub fn per_second(&self, interval: Duration) -> f64 {
        per_second(self.count, interval)
    }
}

/// Harvested view of one bucket, produced fresh on every rotation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QpsReport {
    /// Sequence number of the rotation that vacated the bucket (1-based).
    pub epoch: u64,
    /// Ring slot that was harvested.
    pub bucket: usize,
    /// Length of the bucket's lifetime in milliseconds.
    pub interval_ms: u64,
    /// One record per distinct key; order is unspecified.
    pub records: Vec<QpsInfo>,
    /// Sum of all record counts.
    pub total: u64,
}

impl QpsReport {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Total requests per second across all keys.
    pub fn qps(&self) -> f64 {
        per_second(self.total, self.interval())
    }
}

fn per_second(count: u64, interval: Duration) -> f64 {
    if interval.is_zero() {
        0.0
    } else {
        count as f64 / interval.as_secs_f64()
    }
}

/// Receives one report per rotation, on a blocking-pool thread.
pub trait ReportSink: Send + Sync + 'static {
    fn report(&self, report: QpsReport);
}

impl<F> ReportSink for F
where
    F: Fn(QpsReport) + Send + Sync + 'static,
{
    fn report(&self, report: QpsReport) {
        self(report);
    }
}

/// What `record` does when the mutation queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Wait for queue capacity (backpressure on the request).
    #[default]
    Block,
    /// Drop the increment; the request is unaffected and the count is lost.
    Drop,
}

impl FromStr for Overflow {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            other => Err(ServiceError::InvalidConfig(format!(
                "unknown overflow policy '{other}' (expected 'block' or 'drop')"
            ))),
        }
    }
}

/// How increments reach the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QpsStrategy {
    /// Request tasks lock the current bucket and increment directly.
    #[default]
    Locked,
    /// Request tasks push keys into a bounded queue drained by one
    /// mutation task.
    Queued { capacity: usize, overflow: Overflow },
}

/// Construction parameters for a [`QpsReporter`].
#[derive(Debug, Clone)]
pub struct QpsConfig {
    pub interval: Duration,
    pub ring_size: usize,
    pub strategy: QpsStrategy,
}

impl Default for QpsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ring_size: 60,
            strategy: QpsStrategy::Locked,
        }
    }
}

/// Result of recording one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The queue was full (drop policy) or the mutation task has stopped.
    Dropped,
}

/// Builds the counter key for an endpoint.
pub fn endpoint_key(method: &str, path: &str) -> String {
    format!("{method}|{path}")
}

/// Rotating per-endpoint request counter. Cheap to clone.
#[derive(Clone)]
pub struct QpsReporter {
    inner: Arc<Inner>,
}

struct Inner {
    ring: RotatingCounter,
    interval: Duration,
    writer: Writer,
    /// Every epoch up to this one has been harvested or discarded. Rotation
    /// and harvest both happen under this lock.
    settled: Mutex<u64>,
    started: AtomicBool,
}

enum Writer {
    Direct,
    Queued {
        tx: mpsc::Sender<String>,
        rx: Mutex<Option<mpsc::Receiver<String>>>,
        overflow: Overflow,
    },
}

impl QpsReporter {
    pub fn new(config: QpsConfig) -> Result<Self, ServiceError> {
        if config.interval.is_zero() {
            return Err(ServiceError::InvalidConfig(
                "QPS rotation interval must be positive".to_string(),
            ));
        }
        let ring = RotatingCounter::new(config.ring_size)?;

        let writer = match config.strategy {
            QpsStrategy::Locked => Writer::Direct,
            QpsStrategy::Queued { capacity: 0, .. } => {
                return Err(ServiceError::InvalidConfig(
                    "QPS queue capacity must be positive".to_string(),
                ));
            }
            QpsStrategy::Queued { capacity, overflow } => {
                let (tx, rx) = mpsc::channel(capacity);
                Writer::Queued {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    overflow,
                }
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                ring,
                interval: config.interval,
                writer,
                settled: Mutex::new(0),
                started: AtomicBool::new(false),
            }),
        })
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn ring(&self) -> &RotatingCounter {
        &self.inner.ring
    }

    /// Counts one request against `method|path` in the current bucket.
    ///
    /// Under the queued strategy with [`Overflow::Block`] this waits for
    /// queue capacity; the queue only drains once [`start`](Self::start)
    /// has been called.
    pub async fn record(&self, method: &str, path: &str) -> RecordOutcome {
        let key = endpoint_key(method, path);
        match &self.inner.writer {
            Writer::Direct => {
                self.inner.ring.increment(&key);
                RecordOutcome::Recorded
            }
            Writer::Queued {
                tx,
                overflow: Overflow::Block,
                ..
            } => match tx.send(key).await {
                Ok(()) => RecordOutcome::Recorded,
                Err(_) => RecordOutcome::Dropped,
            },
            Writer::Queued {
                tx,
                overflow: Overflow::Drop,
                ..
            } => match tx.try_send(key) {
                Ok(()) => RecordOutcome::Recorded,
                Err(TrySendError::Full(key)) => {
                    tracing::trace!(%key, "QPS queue full, increment dropped");
                    RecordOutcome::Dropped
                }
                Err(TrySendError::Closed(key)) => {
                    tracing::trace!(%key, "QPS mutation task stopped, increment dropped");
                    RecordOutcome::Dropped
                }
            },
        }
    }

    /// Live count for an endpoint in the current bucket.
    pub fn current_count(&self, method: &str, path: &str) -> u64 {
        self.inner.ring.count(&endpoint_key(method, path))
    }

    /// Rotates and harvests on the caller's task, bypassing the timer.
    pub fn rotate_now(&self) -> QpsReport {
        let _settled = self.inner.settled.lock();
        let vacated = self.inner.ring.rotate();
        self.harvest(vacated, self.inner.ring.rotations())
    }

    /// Rotation step of the background task. Returns the vacated slot and
    /// the epoch it closed.
    fn advance(&self) -> (usize, u64) {
        let ring = &self.inner.ring;
        let mut settled = self.inner.settled.lock();
        let epoch = ring.rotations() + 1;

        // The slot about to become current still holds the epoch vacated one
        // lap ago. If the harvester has not taken it yet, drop it now.
        let reopened = epoch.saturating_sub(ring.ring_size() as u64 - 1);
        if reopened > *settled {
            let slot = (ring.current_index() + 1) % ring.ring_size();
            ring.clear(slot);
            *settled = reopened;
            tracing::warn!(
                bucket = slot,
                epoch = reopened,
                "QPS harvester is a full ring behind; bucket discarded"
            );
        }

        (ring.rotate(), epoch)
    }

    /// Harvest step of the background task. `None` when the epoch was
    /// already discarded by [`advance`](Self::advance).
    fn take_epoch(&self, bucket: usize, epoch: u64) -> Option<QpsReport> {
        let mut settled = self.inner.settled.lock();
        if epoch <= *settled {
            return None;
        }
        *settled = epoch;
        Some(self.harvest(bucket, epoch))
    }

    fn harvest(&self, bucket: usize, epoch: u64) -> QpsReport {
        let harvest = self.inner.ring.harvest(bucket);
        QpsReport {
            epoch,
            bucket,
            interval_ms: self.inner.interval.as_millis() as u64,
            records: harvest
                .entries
                .into_iter()
                .map(|(path, count)| QpsInfo { path, count })
                .collect(),
            total: harvest.total,
        }
    }

    /// Spawns the rotation and harvester tasks (plus the mutation task for
    /// the queued strategy). Requires a Tokio runtime.
    pub fn start<S: ReportSink>(
        &self,
        sink: S,
        shutdown: CancellationToken,
    ) -> Result<TaskHandle, ServiceError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::AlreadyStarted);
        }

        let mut handle = TaskHandle::new(shutdown.clone());

        if let Writer::Queued { rx, .. } = &self.inner.writer
            && let Some(rx) = rx.lock().take()
        {
            handle.push(self.spawn_mutator(rx, shutdown.clone()));
        }

        let (vacated_tx, vacated_rx) = mpsc::channel(self.inner.ring.ring_size() - 1);
        handle.push(self.spawn_harvester(vacated_rx, sink, shutdown.clone()));

        let reporter = self.clone();
        handle.push(spawn_rotation(
            "qps",
            self.inner.interval,
            shutdown,
            move || {
                let (vacated, epoch) = reporter.advance();
                match vacated_tx.try_send((vacated, epoch)) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(TrySendError::Full(_)) => {
                        reporter.inner.ring.clear(vacated);
                        tracing::warn!(
                            bucket = vacated,
                            epoch,
                            "QPS hand-off queue full; bucket discarded"
                        );
                        ControlFlow::Continue(())
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::error!("QPS harvester stopped; reporting halted");
                        ControlFlow::Break(())
                    }
                }
            },
        ));

        tracing::info!(
            interval_ms = self.inner.interval.as_millis() as u64,
            ring_size = self.inner.ring.ring_size(),
            queued = matches!(self.inner.writer, Writer::Queued { .. }),
            "QPS reporter started"
        );

        Ok(handle)
    }

    fn spawn_harvester<S: ReportSink>(
        &self,
        mut vacated: mpsc::Receiver<(usize, u64)>,
        sink: S,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let reporter = self.clone();
        let sink = Arc::new(sink);
        tokio::spawn(async move {
            loop {
                let (bucket, epoch) = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    next = vacated.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let Some(report) = reporter.take_epoch(bucket, epoch) else {
                    continue;
                };

                let sink = Arc::clone(&sink);
                if let Err(e) = tokio::task::spawn_blocking(move || sink.report(report)).await {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                    // Runtime is shutting down.
                    break;
                }
            }
        })
    }

    fn spawn_mutator(
        &self,
        mut keys: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    key = keys.recv() => match key {
                        Some(key) => {
                            reporter.inner.ring.increment(&key);
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn reporter(strategy: QpsStrategy) -> QpsReporter {
        QpsReporter::new(QpsConfig {
            interval: Duration::from_secs(1),
            ring_size: 4,
            strategy,
        })
        .unwrap()
    }

    fn sorted(report: &QpsReport) -> Vec<(String, u64)> {
        let mut records: Vec<_> = report
            .records
            .iter()
            .map(|r| (r.path.clone(), r.count))
            .collect();
        records.sort();
        records
    }

    type Collected = Arc<Mutex<Vec<QpsReport>>>;

    fn collecting_sink() -> (Collected, impl ReportSink) {
        let reports: Collected = Arc::default();
        let sink_reports = Arc::clone(&reports);
        (reports, move |report: QpsReport| sink_reports.lock().push(report))
    }

    #[test]
    fn rejects_invalid_config() {
        let zero_interval = QpsConfig {
            interval: Duration::ZERO,
            ..QpsConfig::default()
        };
        assert!(QpsReporter::new(zero_interval).is_err());

        let tiny_ring = QpsConfig {
            ring_size: 1,
            ..QpsConfig::default()
        };
        assert!(QpsReporter::new(tiny_ring).is_err());

        let no_queue = QpsConfig {
            strategy: QpsStrategy::Queued {
                capacity: 0,
                overflow: Overflow::Drop,
            },
            ..QpsConfig::default()
        };
        assert!(QpsReporter::new(no_queue).is_err());
    }

    #[test]
    fn overflow_parses() {
        assert_eq!("block".parse::<Overflow>().unwrap(), Overflow::Block);
        assert_eq!("drop".parse::<Overflow>().unwrap(), Overflow::Drop);
        assert!("spill".parse::<Overflow>().is_err());
    }

    #[tokio::test]
    async fn harvest_groups_by_method_and_path() {
        let qps = reporter(QpsStrategy::Locked);
        for _ in 0..3 {
            qps.record("GET", "/a").await;
        }
        for _ in 0..2 {
            qps.record("GET", "/b").await;
        }
        qps.record("POST", "/a").await;
        assert_eq!(qps.current_count("GET", "/a"), 3);

        let report = qps.rotate_now();
        assert_eq!(report.epoch, 1);
        assert_eq!(report.bucket, 0);
        assert_eq!(report.total, 6);
        assert_eq!(
            sorted(&report),
            vec![
                ("GET|/a".to_string(), 3),
                ("GET|/b".to_string(), 2),
                ("POST|/a".to_string(), 1),
            ]
        );
        assert_eq!(qps.current_count("GET", "/a"), 0);
    }

    #[tokio::test]
    async fn idle_epoch_reports_nothing() {
        let qps = reporter(QpsStrategy::Locked);
        let report = qps.rotate_now();
        assert!(report.records.is_empty());
        assert_eq!(report.total, 0);
        assert_eq!(report.qps(), 0.0);
    }

    #[test]
    fn rates_scale_with_interval() {
        let info = QpsInfo {
            path: "GET|/a".to_string(),
            count: 30,
        };
        assert_eq!(info.per_second(Duration::from_secs(2)), 15.0);
        assert_eq!(info.per_second(Duration::ZERO), 0.0);
    }

    #[test]
    fn report_serializes_records() {
        let report = QpsReport {
            epoch: 3,
            bucket: 2,
            interval_ms: 1000,
            records: vec![QpsInfo {
                path: "GET|/a".to_string(),
                count: 4,
            }],
            total: 4,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["records"][0]["path"], "GET|/a");
        assert_eq!(json["records"][0]["count"], 4);
        assert_eq!(json["total"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_follow_ring_order() {
        let qps = reporter(QpsStrategy::Locked);
        let (reports, sink) = collecting_sink();
        let handle = qps.start(sink, CancellationToken::new()).unwrap();

        for _ in 0..3 {
            qps.record("GET", "/a").await;
        }
        time::sleep(Duration::from_millis(1_500)).await;
        for _ in 0..2 {
            qps.record("GET", "/b").await;
        }
        time::sleep(Duration::from_secs(4)).await;

        let reports = reports.lock().clone();
        assert_eq!(reports.len(), 5);
        let buckets: Vec<_> = reports.iter().map(|r| r.bucket).collect();
        assert_eq!(buckets, vec![0, 1, 2, 3, 0]);
        let epochs: Vec<_> = reports.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
        assert_eq!(sorted(&reports[0]), vec![("GET|/a".to_string(), 3)]);
        assert_eq!(sorted(&reports[1]), vec![("GET|/b".to_string(), 2)]);
        assert!(reports[2..].iter().all(|r| r.total == 0));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let qps = reporter(QpsStrategy::Locked);
        let handle = qps.start(|_: QpsReport| {}, CancellationToken::new()).unwrap();
        assert!(matches!(
            qps.start(|_: QpsReport| {}, CancellationToken::new()),
            Err(ServiceError::AlreadyStarted)
        ));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_strategy_counts_through_mutation_task() {
        let qps = reporter(QpsStrategy::Queued {
            capacity: 8,
            overflow: Overflow::Block,
        });
        let handle = qps.start(|_: QpsReport| {}, CancellationToken::new()).unwrap();
        assert_eq!(handle.task_count(), 3);

        for _ in 0..20 {
            assert_eq!(qps.record("GET", "/q").await, RecordOutcome::Recorded);
        }
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(qps.current_count("GET", "/q"), 20);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn drop_policy_sheds_when_queue_is_full() {
        let qps = reporter(QpsStrategy::Queued {
            capacity: 2,
            overflow: Overflow::Drop,
        });
        assert_eq!(qps.record("GET", "/a").await, RecordOutcome::Recorded);
        assert_eq!(qps.record("GET", "/a").await, RecordOutcome::Recorded);
        assert_eq!(qps.record("GET", "/a").await, RecordOutcome::Dropped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lapped_harvester_discards_skipped_epochs() {
        let qps = QpsReporter::new(QpsConfig {
            interval: Duration::from_millis(50),
            ring_size: 4,
            strategy: QpsStrategy::Locked,
        })
        .unwrap();

        let gate = Arc::new(std::sync::Barrier::new(2));
        let (tx, mut rx) = mpsc::unbounded_channel::<QpsReport>();
        let sink = {
            let gate = Arc::clone(&gate);
            let held = AtomicBool::new(false);
            move |report: QpsReport| {
                let first = !held.swap(true, Ordering::AcqRel);
                let _ = tx.send(report);
                if first {
                    gate.wait();
                }
            }
        };
        let handle = qps.start(sink, CancellationToken::new()).unwrap();

        // The sink is now held on the first report. Traffic recorded here
        // lands in a slot the harvester will be lapped on.
        let first = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        for _ in 0..10 {
            qps.record("GET", "/stalled").await;
        }

        // Stay blocked for about twelve ticks, three full laps of the ring.
        time::sleep(Duration::from_millis(600)).await;
        let rotations_at_release = qps.ring().rotations();
        assert!(rotations_at_release >= first.epoch + 8);
        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();

        time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        assert_eq!(reports[0], first);
        assert!(reports.len() > 1, "reporting resumes after the stall");

        // Skipped epochs are missing; reporting resumes past the lap.
        assert!(reports[1].epoch > first.epoch + 4);
        assert!(reports[1].epoch + 3 > rotations_at_release);
        assert!(reports.windows(2).all(|w| w[0].epoch < w[1].epoch));

        // Each report names the slot its epoch vacated, never a later one.
        for report in &reports {
            assert_eq!(report.bucket, ((report.epoch - 1) % 4) as usize);
        }

        // The lapped slot was cleared, not carried into a later lifetime.
        assert!(
            reports
                .iter()
                .flat_map(|r| &r.records)
                .all(|r| r.path != "GET|/stalled")
        );
        for index in 0..4 {
            assert!(
                qps.ring()
                    .snapshot(index)
                    .iter()
                    .all(|(key, _)| key != "GET|/stalled")
            );
        }
    }

    #[tokio::test]
    async fn drop_policy_sheds_after_mutation_task_stops() {
        let qps = reporter(QpsStrategy::Queued {
            capacity: 2,
            overflow: Overflow::Drop,
        });
        let handle = qps.start(|_: QpsReport| {}, CancellationToken::new()).unwrap();
        handle.shutdown().await;

        assert_eq!(qps.record("GET", "/a").await, RecordOutcome::Dropped);
        assert_eq!(qps.current_count("GET", "/a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sink_halts_reporting() {
        let qps = reporter(QpsStrategy::Locked);
        let handle = qps
            .start(
                |_: QpsReport| panic!("sink failure"),
                CancellationToken::new(),
            )
            .unwrap();

        qps.record("GET", "/a").await;
        time::sleep(Duration::from_millis(2_500)).await;

        assert!(handle.is_finished());
        let rotations = qps.ring().rotations();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(qps.ring().rotations(), rotations);
        handle.shutdown().await;
    }
}
