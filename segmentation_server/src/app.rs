use crate::config::Config;
use crate::cv_utils::OpenCvVideoOpener;
use crate::lifecycle::SessionLifecycle;
use crate::server::{HttpServer, SharedState};
use crate::session::SessionRegistry;
use crate::telemetry::Metrics;
use segmentation_model::OrtModelService;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let model = match OrtModelService::new(&config.model) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            tracing::error!("Failed to load segmentation model: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let registry = Arc::new(SessionRegistry::new());
    let lifecycle = Arc::new(SessionLifecycle::new(
        registry,
        config.storage.temp_dir.clone(),
    ));
    tracing::info!("Session files go under {:?}", config.storage.temp_dir);

    let state = SharedState {
        lifecycle,
        model,
        frame_source: Arc::new(OpenCvVideoOpener),
        metrics,
    };

    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = server_handle.await {
        tracing::error!("Server stopped with error: {:?}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
