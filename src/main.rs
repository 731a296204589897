//! Tallyring Server entry point.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tallyring_server::AppState;
use tallyring_server::config::Config;
use tallyring_service::ServiceState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let service_config = config.service_config();
    let service = ServiceState::new(&service_config)?;
    let state = AppState::new(service.clone(), config.trust_forwarded_for);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        qps_interval_ms = config.qps_interval_ms,
        qps_buckets = config.qps_buckets,
        quota_rules = ?service.quota().rules().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Tallyring Server starting",
    );

    let shutdown = CancellationToken::new();
    let background = service.start(tallyring_server::log_report, shutdown.child_token())?;

    let app = tallyring_server::router(state);

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Tallyring Server ready");

    tallyring_http::serve(listener, app, shutdown_signal(shutdown)).await?;

    background.shutdown().await;
    tracing::info!("Tallyring Server shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install signal handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
