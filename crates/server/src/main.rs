mod bootstrap;
mod flows;
mod health;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use closeflow_core::config::{AppConfig, LoadOptions};
use closeflow_orchestrator::spawn_scanner;
use tracing::{info, warn};

fn init_logging(config: &AppConfig) {
    use closeflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let scan_interval = match app.config.orchestrator.scan_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let routes = Router::new()
        .merge(health::router(health::HealthState::new(
            app.db_pool.clone(),
            app.orchestrator.clone(),
            scan_interval,
        )))
        .merge(flows::router(app.orchestrator.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let scanner = scan_interval.map(|period| spawn_scanner(app.orchestrator.clone(), period));

    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        scanner_enabled = scanner.is_some(),
        "closeflow-server started"
    );
    axum::serve(listener, routes).with_graceful_shutdown(wait_for_shutdown()).await?;

    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "closeflow-server stopping"
    );
    if let Some(scanner) = scanner {
        let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, scanner.stop()).await.is_err() {
            warn!(
                event_name = "system.server.scanner_shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "background scanner did not stop within the grace period"
            );
        }
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
