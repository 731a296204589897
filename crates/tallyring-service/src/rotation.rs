//! Timer-driven rotation loop and background task handles.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Background tasks spawned by a policy instance.
///
/// Dropping the handle leaves the tasks running; call [`TaskHandle::shutdown`]
/// to stop them.
#[must_use = "background tasks keep running until shut down"]
pub struct TaskHandle {
    tokens: Vec<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            tokens: vec![shutdown],
            tasks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Folds another handle into this one.
    pub fn merge(&mut self, other: TaskHandle) {
        self.tokens.extend(other.tokens);
        self.tasks.extend(other.tasks);
    }

    /// Number of spawned tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` once every task has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Cancels all tasks and waits for them to exit. In-flight harvests are
    /// abandoned.
    pub async fn shutdown(self) {
        for token in &self.tokens {
            token.cancel();
        }
        for task in self.tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::warn!("background task had panicked before shutdown");
            }
        }
    }
}

/// Spawns a task calling `on_tick` once per `period` until `shutdown` is
/// cancelled or `on_tick` breaks.
///
/// The first tick fires one full period after spawning. Late ticks are
/// delayed rather than bursted, so a stalled scheduler never rotates several
/// buckets back to back.
pub(crate) fn spawn_rotation<F>(
    policy: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut on_tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(
            policy,
            period_ms = period.as_millis() as u64,
            "rotation task started"
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if on_tick().is_break() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(policy, "rotation task stopped");
    })
}
