use std::net::SocketAddr;

use chatrelay::{app, build_state, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG controls verbosity; defaults to info.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let state = build_state(config).await?;
    let relay = state.coordinator.config();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_wait_secs = relay.max_wait.as_secs(),
        reasoning_workers = relay.reasoning_workers,
        groups = state.groups.len(),
        "relay configured"
    );

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "listening");

    // In-flight reasoning workers are dropped with the runtime on shutdown.
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
