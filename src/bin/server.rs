use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use imgpress::api::{router, AppState};
use imgpress::cleanup::CleanupScheduler;
use imgpress::events::EventBroker;
use imgpress::{AppResult, Config, FsBlobSink, ImageTransformer, OptimizationService};

#[tokio::main]
async fn main() -> AppResult<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let transformer = match &config.watermark_font_path {
        Some(path) => match tokio::fs::read(path).await {
            Ok(bytes) => ImageTransformer::new().with_watermark_font(bytes)?,
            Err(err) => {
                warn!(path = %path.display(), %err, "watermark font unavailable, watermarking disabled");
                ImageTransformer::new()
            }
        },
        None => ImageTransformer::new(),
    };

    let blob = Arc::new(FsBlobSink::new(&config.storage_dir)?);
    let broker = Arc::new(EventBroker::new(config.sse_idle_ttl, config.sse_grace));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let upload_dir = config.upload_dir.clone();

    let service = OptimizationService::new(config, Arc::new(transformer), blob, broker);
    let mut scheduler = CleanupScheduler::start(service.clone(), upload_dir);

    let app = router(AppState {
        service: service.clone(),
    });

    info!(%addr, "imgpress listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    scheduler.stop().await;
    service.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
