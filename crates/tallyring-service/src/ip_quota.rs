//! Per-client request quotas over rotating windows.
//!
//! Transport-agnostic core. The HTTP adapter extracts the client IP and
//! calls `check()`.
//!
//! Each [`QuotaRule`] owns a ring that rotates once per rule window. Only the
//! current bucket is consulted; on rotation the vacated bucket is replaced by
//! an empty map, so every client starts the next window from zero.
//!
//! A request that read the cursor just before a rotation still lands in the
//! vacated bucket. If it takes the bucket lock before the reset, the count is
//! forgotten with the old map. If it takes the lock after the reset, the count
//! stays in the fresh map and is charged again when that slot becomes current
//! one lap later. Either way the error is at most the checks in flight during
//! the rotation.

use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::ring::RotatingCounter;
use crate::rotation::{TaskHandle, spawn_rotation};

/// At most `max_count` requests per client per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRule {
    pub window: Duration,
    pub max_count: u64,
}

impl QuotaRule {
    pub const fn new(window: Duration, max_count: u64) -> Self {
        Self { window, max_count }
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if self.window.is_zero() {
            return Err(ServiceError::InvalidConfig(format!(
                "quota rule {self}: window must be positive"
            )));
        }
        if self.max_count == 0 {
            return Err(ServiceError::InvalidConfig(format!(
                "quota rule {self}: max count must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Formats as `<window seconds>:<max count>`.
impl fmt::Display for QuotaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.window.as_secs(), self.max_count)
    }
}

/// Parses `<window seconds>:<max count>`, e.g. `60:200`.
impl FromStr for QuotaRule {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ServiceError::InvalidConfig(format!(
                "quota rule '{s}' must look like <window seconds>:<max count>"
            ))
        };
        let (window, max) = s.trim().split_once(':').ok_or_else(invalid)?;
        let window: u64 = window.trim().parse().map_err(|_| invalid())?;
        let max_count: u64 = max.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(Duration::from_secs(window), max_count))
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

/// In-memory per-client quota guard. Cheap to clone.
#[derive(Clone)]
pub struct IpQuotaGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    rules: Vec<RuleRing>,
    started: AtomicBool,
}

struct RuleRing {
    rule: QuotaRule,
    ring: RotatingCounter,
}

impl IpQuotaGuard {
    /// Creates a guard enforcing every rule in `rules`. An empty list
    /// creates a disabled guard.
    pub fn new(rules: Vec<QuotaRule>, ring_size: usize) -> Result<Self, ServiceError> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                rule.validate()?;
                Ok(RuleRing {
                    rule,
                    ring: RotatingCounter::new(ring_size)?,
                })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        Ok(Self {
            inner: Arc::new(GuardInner {
                rules,
                started: AtomicBool::new(false),
            }),
        })
    }

    /// A guard that allows everything.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(GuardInner {
                rules: Vec::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.inner.rules.is_empty()
    }

    pub fn rules(&self) -> Vec<QuotaRule> {
        self.inner.rules.iter().map(|r| r.rule).collect()
    }

    /// Admits the request if `client` is under every rule's threshold.
    ///
    /// An admitted request is counted against every rule. A denied request
    /// is counted against none, so counts stop at the threshold.
    pub fn check(&self, client: &str) -> Decision {
        let decision = match self.inner.rules.as_slice() {
            [] => return Decision::Allow,
            [only] => match only.ring.increment_below(client, only.rule.max_count) {
                Some(_) => Decision::Allow,
                None => Decision::Deny,
            },
            rules => {
                // Fixed lock order (rule order) across all callers.
                let mut buckets: Vec<_> = rules.iter().map(|r| r.ring.lock_current()).collect();
                let under = buckets
                    .iter()
                    .zip(rules)
                    .all(|(bucket, r)| bucket.count(client) < r.rule.max_count);
                if under {
                    for bucket in &mut buckets {
                        bucket.bump(client);
                    }
                    Decision::Allow
                } else {
                    Decision::Deny
                }
            }
        };

        if decision == Decision::Deny {
            tracing::debug!(client, "request quota exceeded");
        }
        decision
    }

    /// Current-window count of `client` for each rule, in rule order.
    pub fn usage(&self, client: &str) -> Vec<u64> {
        self.inner
            .rules
            .iter()
            .map(|r| r.ring.count(client))
            .collect()
    }

    /// Advances rule `index` to its next window and discards the vacated
    /// bucket. Returns the vacated slot, or `None` for an unknown rule.
    pub fn rotate_rule(&self, index: usize) -> Option<usize> {
        let rule = self.inner.rules.get(index)?;
        let vacated = rule.ring.rotate();
        rule.ring.clear(vacated);
        Some(vacated)
    }

    /// Spawns one rotation task per rule, each ticking at its rule window.
    pub fn start(&self, shutdown: CancellationToken) -> Result<TaskHandle, ServiceError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::AlreadyStarted);
        }

        let mut handle = TaskHandle::new(shutdown.clone());
        for (index, rule) in self.inner.rules.iter().enumerate() {
            let guard = self.clone();
            handle.push(spawn_rotation(
                "ip_quota",
                rule.rule.window,
                shutdown.clone(),
                move || {
                    guard.rotate_rule(index);
                    ControlFlow::Continue(())
                },
            ));
            tracing::info!(rule = %rule.rule, "IP quota rule active");
        }
        Ok(handle)
    }
}
