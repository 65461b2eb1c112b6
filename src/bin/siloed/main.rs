use std::sync::Arc;

use silo::archive::FilenameArchive;
use silo::api::ServerState;
use silo::config::Config;
use silo::context::Context;
use silo::manager::{Engine, Manager};
use tokio::signal;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() {
    let config = Config::load();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::EnvFilter::new(&config.log))
        .init();

    if config.api_token.is_none() {
        tracing::warn!("SILO_API_TOKEN is not set; the HTTP API is unauthenticated");
    }

    let ctx = Context::new(&config.base_dir);
    let engine = Engine::open(ctx, Arc::new(FilenameArchive::default())).expect("failed to open engine");
    let manager = Manager::new(engine.clone());

    let scheduler = silo::jobs::scheduler::Scheduler::start(engine.clone(), config.async_workers);

    let state = ServerState {
        manager,
        api_token: config.api_token.clone(),
    };
    let app = silo::server::new(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {}: {err}", config.bind_addr));
    info!(addr = %config.bind_addr, workers = config.async_workers, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server loop failed");

    info!("shutting down scheduler");
    scheduler.close().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
