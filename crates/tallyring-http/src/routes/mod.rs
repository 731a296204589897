//! HTTP route handlers.

pub mod system;
