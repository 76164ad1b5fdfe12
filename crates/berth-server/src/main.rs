use std::net::SocketAddr;
use std::sync::Arc;

use berth_instance::LogLevel;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing_subscriber::prelude::*;

mod api;
mod assets;
mod config;
mod error;
mod extensions;
mod logbus;
mod logfile;
mod ports;
mod probe;
mod proxy;
mod runner;
mod store;
mod supervisor;
mod workspace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(config::Config::from_env());

    // Ensure the roots exist early so the store, health checks, and instance
    // creation are stable.
    std::fs::create_dir_all(&cfg.data_root)?;
    std::fs::create_dir_all(&cfg.workspace_root)?;
    std::fs::create_dir_all(&cfg.logs_root)?;

    // Persist supervisor logs under the logs root and keep stdout logs for
    // docker/dev.
    let file_appender = tracing_appender::rolling::daily(&cfg.logs_root, "berth.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    let store = Arc::new(store::InstanceStore::open(
        cfg.servers_file(),
        cfg.port_start,
        cfg.port_end,
    ));
    let bus = Arc::new(logbus::LogBus::new(logbus::DEFAULT_MAX_RECORDS));
    bus.system(LogLevel::Info, "Process manager initialized");
    let files = Arc::new(logfile::InstanceLogs::new(cfg.logs_root.clone()));

    let supervisor =
        supervisor::Supervisor::new(cfg.clone(), store.clone(), bus.clone(), files.clone())?;
    supervisor.spawn_background_loops();

    let proxy_client: Client<HttpConnector, axum::body::Body> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let state = api::AppState {
        cfg: cfg.clone(),
        supervisor: supervisor.clone(),
        store,
        bus,
        proxy_client,
    };
    let app = api::router(state);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.http_port).into();
    tracing::info!(%addr, prefix = %cfg.proxy_prefix, "berth-server HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(supervisor))
    .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM, then terminate every known child. No graceful
/// drain of in-flight proxy connections is attempted.
async fn shutdown_signal(supervisor: supervisor::Supervisor) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received; terminating children");
    supervisor.shutdown();
}
