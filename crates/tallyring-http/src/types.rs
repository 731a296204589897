//! Response bodies for the system endpoints.

use serde::Serialize;

use tallyring_service::qps::QpsReport;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server status ("ok").
    pub status: String,
    /// Server version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_seconds: u64,
    /// Whether any IP quota rule is enforced.
    pub quota_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct QpsStatusResponse {
    /// Rotation interval of the QPS ring in milliseconds.
    pub interval_ms: u64,
    /// Ring slot currently absorbing increments.
    pub current_bucket: usize,
    /// Most recently harvested bucket, `null` before the first rotation.
    pub last_report: Option<QpsReport>,
}
