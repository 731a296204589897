//! Service-layer error types.
//!
//! `ServiceError` is transport-agnostic and only surfaces at construction and
//! startup. Quota denials are a [`Decision`](crate::ip_quota::Decision), not
//! an error.

/// Service error shared by the counter, the policies and the host wiring.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Invalid construction parameters (ring size, interval, quota rule).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Background tasks for this policy instance were already spawned.
    #[error("background tasks already started")]
    AlreadyStarted,
}
