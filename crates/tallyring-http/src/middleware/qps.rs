//! Request counting middleware. Never rejects.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

/// Counts the request under `method|path` and continues.
///
/// The raw URI path is used, so path parameters produce distinct keys.
pub async fn qps_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    state.record_request(method.as_str(), &path).await;
    next.run(req).await
}
