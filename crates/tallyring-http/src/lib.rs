//! Tallyring HTTP: axum adapter for the tallyring request hooks.
//!
//! Provides:
//! - `qps_middleware`: counts every request under `method|path`
//! - `ip_quota_middleware`: rejects clients over quota with 429
//! - [`instrument`] to wrap any host router with both hooks
//! - System endpoints (`/health`, `/qps`, `/metrics`)

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Wraps `router` with the quota guard and QPS counting.
///
/// QPS counting is the outer layer, so rejected requests still show up in
/// the rate reports.
pub fn instrument<S>(router: Router<S>, state: &AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::ip_quota::ip_quota_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::qps::qps_middleware,
        ))
}

/// Builds the system router (`/health`, `/qps`, `/metrics`) with both
/// hooks applied.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(routes::system::health))
        .route("/qps", get(routes::system::qps_status))
        .route("/metrics", get(routes::system::metrics_endpoint));

    instrument(api, &state)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router on the given listener with graceful shutdown.
///
/// Wraps `axum::serve` with `ConnectInfo<SocketAddr>` so the quota guard can
/// see client addresses.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
