use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use synth_core::ChatterboxModel;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tts_server::config::ServerConfig;
use tts_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    info!("Starting {} speech service...", config.app_name);

    let chatterbox_config = config.chatterbox_config()?;
    info!(
        "Loading Chatterbox model from {} on {}",
        chatterbox_config.model_dir.display(),
        chatterbox_config.device
    );
    let load_started = Instant::now();
    let model = tokio::task::spawn_blocking(move || ChatterboxModel::load(chatterbox_config)).await??;
    info!("Model loaded in {:.1}s", load_started.elapsed().as_secs_f32());

    if !config.bucket_mount.is_dir() {
        warn!(
            "Bucket mount {} does not exist yet; it will be created on first write",
            config.bucket_mount.display()
        );
    }

    let state = AppState::new(Arc::new(model), config.clone());
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, timeout={}s, bucket={}",
        config.port,
        config.rate_limit_per_minute,
        config.request_timeout_secs,
        config.bucket_mount.display()
    );
    if config.proxy_auth.is_none() {
        warn!("PROXY_AUTH_KEY/PROXY_AUTH_SECRET not set, /generate_speech is unauthenticated");
    }

    let app = build_router(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
