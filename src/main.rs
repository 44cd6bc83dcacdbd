use std::sync::Arc;

use chat_relay::ai::GeminiBackend;
use chat_relay::config::{RelayConfig, load_dotenv};
use chat_relay::server::{self, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = load_dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    };
    tracing::info!(?config, "starting relay");

    let backend =
        GeminiBackend::new(config.api_key.clone()).with_api_base(config.api_base.clone());
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        Arc::new(backend),
        config.default_model.clone(),
        shutdown.clone(),
    );
    let app = server::router(state, config.static_dir.as_deref());

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://localhost:{}", config.port);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            shutdown.cancel();
        }
    });

    server::serve(listener, app, shutdown).await?;
    tracing::info!("relay stopped");
    Ok(())
}
