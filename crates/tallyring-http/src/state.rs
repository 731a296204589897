//! HTTP application state: wraps `ServiceState` with HTTP-specific fields.
//!
//! `AppState` provides transparent access to all `ServiceState` methods
//! via `Deref`.

use std::ops::Deref;
use std::sync::Arc;

use tallyring_service::ServiceState;

/// Shared HTTP application state, cloneable across middleware and handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    service: ServiceState,
    trust_forwarded_for: bool,
}

impl Deref for AppState {
    type Target = ServiceState;

    fn deref(&self) -> &ServiceState {
        &self.inner.service
    }
}

impl AppState {
    /// Creates a new HTTP application state.
    ///
    /// With `trust_forwarded_for` the client IP is taken from the first
    /// `X-Forwarded-For` entry; only enable it behind a proxy that sets it.
    pub fn new(service: ServiceState, trust_forwarded_for: bool) -> Self {
        Self {
            inner: Arc::new(AppInner {
                service,
                trust_forwarded_for,
            }),
        }
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.inner.trust_forwarded_for
    }
}
