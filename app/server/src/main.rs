//! HTTP server exposing the chat strategies behind the UI-facing JSON API.

mod routes;

use std::path::PathBuf;

use samvad::ChatConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,samvad=debug".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ChatConfig::default_path);
    let config = if config_path.exists() {
        tracing::info!(path = %config_path.display(), "Loading config file");
        ChatConfig::from_file(&config_path).map_err(anyhow::Error::msg)?
    } else {
        ChatConfig::default()
    }
    .apply_env();
    config.validate().map_err(anyhow::Error::msg)?;

    let bind_addr = config.server.bind_addr.clone();
    let state = routes::AppState::new(config)?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Chat API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
