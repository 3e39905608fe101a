mod api;
mod bootstrap;
mod health;

use std::future::{pending, IntoFuture};
use std::time::Duration;

use aisle_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default()).context("loading configuration")?;
    install_subscriber(&config.logging);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let server = &app.config.server;
    let address = format!("{}:{}", server.bind_address, server.port);
    let drain = Duration::from_secs(server.graceful_shutdown_secs);
    let routes = api::router(app.orchestrator.clone()).merge(health::router(app.db_pool.clone()));

    let listener =
        TcpListener::bind(&address).await.with_context(|| format!("binding {address}"))?;
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "aisle-server listening"
    );

    serve_until_drained(listener, routes, drain).await?;

    info!(event_name = "system.server.stopping", correlation_id = "shutdown", "closing context store");
    app.db_pool.close().await;
    Ok(())
}

fn install_subscriber(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(logging.level.trim()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Serves until ctrl-c, then gives in-flight turns `drain` to finish before returning.
async fn serve_until_drained(listener: TcpListener, routes: Router, drain: Duration) -> Result<()> {
    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let serving = axum::serve(listener, routes)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    let deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(drain).await,
            Err(_) => pending::<()>().await,
        }
    };

    tokio::select! {
        result = serving => result.context("serving http")?,
        () = deadline => warn!(
            event_name = "system.server.drain_timeout",
            correlation_id = "shutdown",
            drain_secs = drain.as_secs(),
            "abandoning turns still running at the drain deadline"
        ),
    }
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(
            event_name = "system.server.shutdown_requested",
            correlation_id = "shutdown",
            "draining in-flight turns"
        ),
        Err(signal_error) => {
            error!(
                event_name = "system.server.signal_error",
                correlation_id = "shutdown",
                error = %signal_error,
                "ctrl-c handler unavailable; serving until killed"
            );
            pending::<()>().await;
        }
    }
}
