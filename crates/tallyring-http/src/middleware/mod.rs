//! HTTP middleware: per-endpoint QPS counting and per-IP quotas.

pub mod ip_quota;
pub mod qps;
