use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, warn};
use tts_core::{PiperVoice, SpeechModel, ToneModel};

use server::{build_router, config::ServerConfig, AppState};

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
    info!("Starting speech server...");

    let config = ServerConfig::from_env();
    let model = load_model(&config)?;
    let info = model.info();
    info!(
        model = %info.name,
        device = %info.device,
        sample_rate = info.sample_rate,
        "Speech model ready"
    );

    let state = AppState::new(model, config.clone());
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, segment_limit={}, encoder={}",
        config.port, config.rate_limit_per_minute, config.segment_limit, config.encoder
    );

    let app = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_model(config: &ServerConfig) -> anyhow::Result<Arc<dyn SpeechModel>> {
    match &config.model_config {
        Some(path) => {
            info!("Loading Piper voice from {}", path.display());
            Ok(Arc::new(PiperVoice::load(path)?))
        }
        None => {
            warn!("TTS_MODEL_CONFIG not set, serving the placeholder tone");
            Ok(Arc::new(ToneModel::new(config.sample_rate)))
        }
    }
}
