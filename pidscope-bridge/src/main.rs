//! Modbus/TCP bridge for a PID frequency controller.
//!
//! Polls the controller's input registers and streams readings to
//! subscribers over SSE and WebSocket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pidscope_bridge::config::BridgeConfig;
use pidscope_bridge::server::{self, AppState};
use pidscope_bridge::{
    BroadcastHub, ConnectionManager, PollingEngine, StatusSnapshot, TcpConnector, WriteGateway,
    event_channel,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Modbus/TCP bridge streaming controller readings to live subscribers.
#[derive(Parser, Debug)]
#[command(name = "pidscope-bridge")]
#[command(about = "Polls a Modbus/TCP controller and streams readings to subscribers")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "pidscope.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    pidscope_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting pidscope-bridge");
    info!("Loaded configuration from {:?}", args.config);

    // Wire the device side
    let (events_tx, events_rx) = event_channel();
    let connection = Arc::new(ConnectionManager::new(
        Box::new(TcpConnector::from_config(&config.device)),
        events_tx.clone(),
    ));
    let engine = Arc::new(PollingEngine::new(
        &config.device,
        connection.clone(),
        events_tx,
    ));
    let gateway = Arc::new(WriteGateway::new(
        connection.clone(),
        engine.status(),
        config.device.write_address,
    ));
    let hub = Arc::new(BroadcastHub::new(gateway));

    let pump = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.run(events_rx).await })
    };
    let poller = engine.clone().spawn();

    // Subscriber server
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    let state = AppState {
        hub: hub.clone(),
        engine: engine.clone(),
        connection: connection.clone(),
        buffer: config.server.subscriber_buffer,
    };
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state).await {
            error!("Subscriber server failed: {}", e);
        }
    });

    info!(
        "Bridge running: device {}, subscribers on {}",
        connection.describe(),
        config.server.listen
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Open streams never end on their own, so the server is cancelled.
    server_task.abort();
    let _ = server_task.await;

    // Give dropped subscriptions a moment to write the neutral setpoint.
    tokio::time::sleep(Duration::from_millis(100)).await;

    poller.close().await;
    pump.abort();

    let status = StatusSnapshot::capture(&connection, &engine, &hub);
    match serde_json::to_string(&status) {
        Ok(json) => info!("Final status: {}", json),
        Err(e) => error!("Failed to serialize final status: {}", e),
    }

    info!("pidscope-bridge stopped");
    Ok(())
}
