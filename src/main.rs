use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use chat_relay::api;
use chat_relay::config::AppConfig;
use chat_relay::gateway::HttpGateway;
use chat_relay::relay::{self, RelayTrigger};
use chat_relay::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📨 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gateway: {}", config.gateway.url);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP API: http://0.0.0.0:{}/api/messages", config.http_port);

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open database")?,
    );

    let gateway =
        Arc::new(HttpGateway::new(&config.gateway).context("Failed to build gateway client")?);
    let trigger = Arc::new(RelayTrigger::new(
        &config.relay,
        Arc::clone(&store),
        gateway,
    ));

    // Subscribe before recovery so nothing created in between is missed
    let dispatcher = relay::spawn_dispatcher(
        Arc::clone(&trigger),
        Arc::clone(&store),
        config.relay.recovery_limit,
    );

    let app = api::router(Arc::clone(&store));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP API started");

    let recovery = relay::spawn_recovery(
        Arc::clone(&trigger),
        Arc::clone(&store),
        config.relay.recovery_limit,
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    recovery.abort();
    dispatcher.abort();
    eprintln!("👋 Chat Relay stopped");
    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
