mod config;
mod error;
mod handlers;
mod models;
mod router;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use config::GatewayConfig;
use market_data::candles::CandleListener;
use market_data::connector::{ConnectorRegistry, PriceEventHandler};
use market_data::processor::{MarketDataProcessor, ProcessorSet};
use market_data::storage::PersistencePipeline;
use market_data::timer::{BoundaryListener, BoundaryTimer};
use persistence::{QueryRepository, Repository, open_repository};
use router::create_router;
use state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = market_data::SERVICE_VERSION, "Starting price stream service");
    let config = GatewayConfig::from_env().context("Failed to load configuration")?;
    info!(
        instruments = config.instruments.len(),
        backends = config.storage.len(),
        buffer_size = config.buffer_size,
        "Configuration loaded"
    );

    // Storage clients may block, so they are created and dropped outside
    // the async runtime.
    let repositories: Vec<Arc<dyn Repository>> = config
        .storage
        .iter()
        .map(open_repository)
        .collect::<Result<_, _>>()
        .context("Failed to open storage backend")?;
    let history: Arc<dyn QueryRepository> = repositories
        .first()
        .map(|repository| Arc::clone(repository).into_query())
        .context("No storage backend configured")?;

    let persistence: Vec<Arc<PersistencePipeline>> = repositories
        .iter()
        .map(|repository| {
            PersistencePipeline::new(Arc::clone(repository).into_save(), config.buffer_size)
                .map(Arc::new)
        })
        .collect::<Result<_, _>>()
        .context("Failed to start persistence pipeline")?;
    let sinks: Vec<Arc<dyn CandleListener>> = persistence
        .iter()
        .map(|pipeline| Arc::clone(pipeline) as Arc<dyn CandleListener>)
        .collect();

    let timer = BoundaryTimer::new();
    let mut processors = ProcessorSet::new();
    for instrument in &config.instruments {
        let processor = Arc::new(
            MarketDataProcessor::new(Arc::clone(instrument), config.buffer_size, sinks.clone())
                .with_context(|| format!("Failed to start processor for {}", instrument.full_name()))?,
        );
        timer.add(Arc::clone(&processor) as Arc<dyn BoundaryListener>);
        processors.insert(processor);
    }
    let processors = Arc::new(processors);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    let served = runtime.block_on(serve(&config, Arc::clone(&processors), history, &timer));

    timer.stop();
    processors.halt_all();
    for pipeline in &persistence {
        pipeline.halt();
    }
    drop(runtime);

    if let Err(e) = &served {
        error!(error = %e, "Service stopped with error");
    }
    info!("Shutdown complete");
    served
}

/// Run the connectors and the HTTP surface until a shutdown signal.
/// Connectors are closed before returning.
async fn serve(
    config: &GatewayConfig,
    processors: Arc<ProcessorSet>,
    history: Arc<dyn QueryRepository>,
    timer: &BoundaryTimer,
) -> anyhow::Result<()> {
    let connectors =
        ConnectorRegistry::for_sources(config.instruments.iter().map(|i| i.source()));
    for processor in processors.iter() {
        connectors.register(Arc::clone(processor) as Arc<dyn PriceEventHandler>)?;
    }

    timer.start().context("Failed to start boundary timer")?;
    connectors.start_all()?;

    let state = AppState::new(
        processors,
        history,
        config.instruments.clone(),
        config.flush_timeout,
    );
    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let served = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "Listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(state.clone()))
                .await
                .context("HTTP server failed")
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to bind {addr}"))),
    };

    state.begin_shutdown();
    connectors.close_all().await;
    info!("Connectors closed");
    served
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, stopping HTTP server");
    state.begin_shutdown();
}
