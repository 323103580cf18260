//! DTC Market Data Binary
//!
//! Connects to a Sierra Chart DTC server, subscribes the configured symbols
//! and logs every price update.
//!
//! # Usage
//!
//! ```bash
//! DTC_SYMBOLS=ESZ25@CME cargo run --bin dtc-market-data
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `SIERRACHART_HOST`: Server host (default: localhost)
//! - `SIERRACHART_PORT`: Server port (default: 11099)
//! - `SIERRACHART_HISTORICAL_PORT`: Separate historical data port (default: unset)
//! - `SIERRACHART_USERNAME` / `SIERRACHART_PASSWORD`: Logon credentials
//! - `DTC_SYMBOLS`: Comma separated `SYMBOL@EXCHANGE` list
//! - `SCID_DATA_DIR`: Tick file directory for fallback (default: unset)
//! - `HEALTH_PORT`: Health check HTTP port (default: 8090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: info,dtc_market_data=debug)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dtc_market_data::application::ports::{Connector, StatusProvider};
use dtc_market_data::infrastructure::hub::{HubConfig, PriceHub};
use dtc_market_data::infrastructure::telemetry;
use dtc_market_data::{
    GatewayConfig, HealthServer, HealthServerState, MarketDataService, PriceUpdate,
    PriceUpdateKind, ReconnectConfig, ReconnectSupervisor, ServiceConfig, SupervisorHandle,
    TcpConnector, TelemetryConfig, init_metrics,
};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard =
        telemetry::init(TelemetryConfig::from_env()).context("failed to initialize logging")?;

    tracing::info!("Starting DTC market data gateway");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let hub = Arc::new(PriceHub::new(HubConfig {
        channel_capacity: config.server.hub_channel_capacity,
    }));

    let live = spawn_supervisor(&config, config.dtc.port, Arc::clone(&hub), &shutdown_token);
    let historical = config.dtc.historical_port.map(|port| {
        tracing::info!(port, "Using separate historical data connection");
        spawn_supervisor(&config, port, Arc::new(PriceHub::default()), &shutdown_token)
    });

    let service = MarketDataService::start(
        ServiceConfig {
            historical_timeout: config.dtc.historical_timeout,
            data_dir: config.tick_files.data_dir.clone(),
            fallback_on_any_reject: config.tick_files.fallback_on_any_reject,
            tailer: config.tailer_config(),
        },
        live,
        historical,
    );

    if config.tick_files.data_dir.is_some() {
        log_tick_files(&service).await;
    }

    for key in &config.symbols {
        let rx = service.subscribe_key(key.clone());
        tokio::spawn(log_updates(key.to_string(), rx, shutdown_token.clone()));
    }

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service) as Arc<dyn StatusProvider>,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(symbols = config.symbols.len(), "Gateway ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, service.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

fn spawn_supervisor(
    config: &GatewayConfig,
    port: u16,
    hub: Arc<PriceHub>,
    shutdown_token: &CancellationToken,
) -> SupervisorHandle {
    let connector: Arc<dyn Connector> = Arc::new(
        TcpConnector::new(config.dtc.host.clone(), port).with_timeout(config.dtc.connect_timeout),
    );
    ReconnectSupervisor::new(
        connector,
        config.session_config(),
        ReconnectConfig::from_settings(&config.reconnect),
        hub,
    )
    .with_cancel(shutdown_token)
    .spawn([])
}

/// Log what the tick file directory holds.
async fn log_tick_files(service: &MarketDataService) {
    match service.tick_file_inventory().await {
        Ok(files) => {
            for file in &files {
                tracing::debug!(
                    symbol = %file.symbol,
                    records = file.records,
                    last = ?file.last_price(),
                    last_at = ?file.last.map(|r| r.timestamp),
                    "Tick file available"
                );
            }
            tracing::info!(files = files.len(), "Tick file directory scanned");
        }
        Err(e) => tracing::warn!(error = %e, "Tick file directory unreadable"),
    }
}

/// Log every update for one symbol until shutdown.
async fn log_updates(
    symbol: String,
    mut rx: broadcast::Receiver<PriceUpdate>,
    shutdown_token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;
            () = shutdown_token.cancelled() => return,
            update = rx.recv() => update,
        };
        match update {
            Ok(update) => log_update(&symbol, &update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(symbol = %symbol, skipped, "Update logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn log_update(symbol: &str, update: &PriceUpdate) {
    match &update.kind {
        PriceUpdateKind::Snapshot(snapshot) => tracing::info!(
            symbol,
            source = ?update.source,
            last = ?snapshot.last_price,
            bid = ?snapshot.bid,
            ask = ?snapshot.ask,
            "Snapshot"
        ),
        PriceUpdateKind::Bar(record) => tracing::info!(
            symbol,
            source = ?update.source,
            close = record.close,
            volume = record.total_volume,
            at = %record.timestamp,
            "Tick file record"
        ),
        PriceUpdateKind::Rejected(rejection) => tracing::warn!(
            symbol,
            rejection = %rejection,
            "Subscription rejected"
        ),
        PriceUpdateKind::Delta(_) => tracing::debug!(
            symbol,
            source = ?update.source,
            price = ?update.last_price(),
            "Update"
        ),
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        server = %config.dtc_addr(),
        historical_port = ?config.dtc.historical_port,
        health_port = config.server.health_port,
        symbols = config.symbols.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        data_dir = ?config.tick_files.data_dir,
        poll_ms = u64::try_from(config.tick_files.poll_interval.as_millis()).unwrap_or(u64::MAX),
        fallback_on_any_reject = config.tick_files.fallback_on_any_reject,
        "Tick file fallback"
    );
}

/// Look for a .env file in ancestor directories.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
