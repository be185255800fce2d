use std::sync::Arc;

use anyhow::Context;

use forgeflow_api::app::{self, services};
use forgeflow_infra::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgeflow_observability::init();

    let config = EngineConfig::from_env();
    let services = Arc::new(
        services::AppServices::from_config(&config, services::builtin_handlers())
            .await
            .context("failed to start engine")?,
    );

    let app = app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!(addr = %listener.local_addr()?, workers = config.workers, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}
