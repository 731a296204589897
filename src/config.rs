//! Server configuration via CLI args and environment variables.

use std::time::Duration;

use clap::Parser;

use tallyring_service::ServiceConfig;
use tallyring_service::ip_quota::QuotaRule;
use tallyring_service::qps::{Overflow, QpsConfig, QpsStrategy};

/// HTTP server with rotating-window QPS reporting and per-IP quotas.
#[derive(Parser, Debug, Clone)]
#[command(name = "tallyring-server", version, about)]
pub struct Config {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0", env = "TALLYRING_HOST")]
    pub host: String,

    /// Bind port.
    #[arg(long, default_value_t = 9998, env = "TALLYRING_PORT")]
    pub port: u16,

    /// QPS bucket lifetime in milliseconds (one report per interval).
    #[arg(long, default_value_t = 1000, env = "TALLYRING_QPS_INTERVAL_MS")]
    pub qps_interval_ms: u64,

    /// Number of buckets in the QPS ring.
    #[arg(long, default_value_t = 60, env = "TALLYRING_QPS_BUCKETS")]
    pub qps_buckets: usize,

    /// Capacity of the QPS increment queue. 0 increments under the bucket
    /// lock instead of queueing.
    #[arg(long, default_value_t = 0, env = "TALLYRING_QPS_QUEUE_CAPACITY")]
    pub qps_queue_capacity: usize,

    /// What to do when the QPS queue is full: "block" or "drop".
    #[arg(long, default_value = "block", env = "TALLYRING_QPS_OVERFLOW")]
    pub qps_overflow: Overflow,

    /// Quota rules as <window seconds>:<max count>, comma-separated.
    #[arg(
        long = "quota-rule",
        default_value = "60:200",
        env = "TALLYRING_QUOTA_RULES",
        value_delimiter = ','
    )]
    pub quota_rules: Vec<QuotaRule>,

    /// Disable the per-IP quota guard.
    #[arg(long, env = "TALLYRING_NO_QUOTA")]
    pub no_quota: bool,

    /// Number of buckets in each quota ring.
    #[arg(long, default_value_t = 16, env = "TALLYRING_QUOTA_BUCKETS")]
    pub quota_buckets: usize,

    /// Take the client IP from X-Forwarded-For (only behind a trusted proxy).
    #[arg(long, env = "TALLYRING_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Log level.
    #[arg(long, default_value = "info", env = "TALLYRING_LOG_LEVEL")]
    pub log_level: String,

    /// Log format: "text" or "json".
    #[arg(long, default_value = "text", env = "TALLYRING_LOG_FORMAT")]
    pub log_format: String,
}

impl Config {
    /// Parses configuration from CLI args and env vars.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Service-layer subset of the configuration. Validated by
    /// `ServiceState::new`.
    pub fn service_config(&self) -> ServiceConfig {
        let strategy = match self.qps_queue_capacity {
            0 => QpsStrategy::Locked,
            capacity => QpsStrategy::Queued {
                capacity,
                overflow: self.qps_overflow,
            },
        };

        ServiceConfig {
            qps: QpsConfig {
                interval: Duration::from_millis(self.qps_interval_ms),
                ring_size: self.qps_buckets,
                strategy,
            },
            quota_rules: if self.no_quota {
                Vec::new()
            } else {
                self.quota_rules.clone()
            },
            quota_ring_size: self.quota_buckets,
        }
    }
}
