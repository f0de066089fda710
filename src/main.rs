use aigate::app::{AppState, build_app};
use aigate::config::RuntimeConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,aigate=debug".into()),
        )
        .init();

    let config = RuntimeConfig::from_env();
    let listen = config.listen.clone();
    let state = AppState::from_config(config).await?;
    state.spawn_reconcile_loop();

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "aigate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
