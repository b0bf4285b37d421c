//! kiln-gateway — HTTP/WebSocket surface of the script execution engine.

use std::sync::Arc;

use clap::Parser;
use kiln_engine::{
    Collaborators, DirSourceStore, Engine, HttpDownstream, LogPublisher, MemoryFunctionRepo,
    MemoryProjectSettings, NullDownstream,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kiln_gateway::config::{Args, SettingsFile};
use kiln_gateway::routes;
use kiln_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let settings = match &args.settings_file {
        Some(path) => SettingsFile::load(path)?.into_settings(),
        None => Arc::new(MemoryProjectSettings::new()),
    };

    let downstream: Arc<dyn kiln_engine::Downstream> = match &args.internal_base {
        Some(base) => Arc::new(HttpDownstream::new(base.clone())),
        None => Arc::new(NullDownstream),
    };

    let collaborators = Collaborators {
        sources: Arc::new(DirSourceStore::new(&args.source_dir)),
        settings,
        functions: Arc::new(MemoryFunctionRepo::new()),
        downstream,
        publisher: Arc::new(LogPublisher),
    };

    let engine = Arc::new(Engine::new(args.engine_config(), collaborators)?);
    info!(
        listen = %args.listen,
        workers = engine.pool_size(),
        "kiln gateway starting"
    );

    let router = routes::router(AppState::new(engine.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(engine) = Arc::into_inner(engine) {
        engine.shutdown().await;
    }
    info!("kiln gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
