use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wheel_backend::config::Config;
use wheel_backend::{app, open_store, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let store = open_store(&config.store).await;
    let state = AppState::from_config(&config, store);
    state.spawn_sweeper(config.client_idle);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, segments = config.wheel.len(), "starting server");
    axum::serve(listener, app(state))
        .await
        .context("server error")?;
    Ok(())
}
