use std::sync::Arc;

use plinth_host::{HostConfig, PluginHost, PluginWatcher, UnloadReport};
use plinth_server::{build_router, AppState, ServerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host_config = HostConfig::load()?;
    let server_config = ServerConfig::load()?;
    let watch = host_config.watch;

    let host = Arc::new(PluginHost::with_dylib_loader(host_config));
    let report = host.start().await?;
    tracing::info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        "plugins loaded"
    );

    let watcher = if watch {
        Some(PluginWatcher::spawn(Arc::clone(&host))?)
    } else {
        None
    };

    let app = build_router(AppState::new(Arc::clone(&host)), &server_config);
    let listener = tokio::net::TcpListener::bind(server_config.bind).await?;
    tracing::info!(addr = %server_config.bind, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drop(watcher);
    for (plugin, outcome) in host.shutdown().await {
        match outcome {
            UnloadReport::Unloaded => tracing::debug!(%plugin, "plugin unloaded"),
            UnloadReport::Pending { inflight } => {
                tracing::warn!(%plugin, inflight, "plugin still busy at shutdown")
            }
            UnloadReport::Blocked { reason } => {
                tracing::warn!(%plugin, %reason, "plugin library could not be closed")
            }
        }
    }
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
