//! Pulse Relay
//!
//! Receives PPG samples from the sensors, detects beats and fans them out
//! to the sound and lighting consumers.
//!
//! Usage: `relay [CONFIG.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_relay::{
    api::ApiServer,
    channel::SystemClock,
    config::AppConfig,
    protocol::AdminCommand,
    relay::Relay,
};

/// Why one run of the pipeline ended
enum Exit {
    Restart,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Pulse Relay");

    let config_path = std::env::args().nth(1).map(PathBuf::from);

    loop {
        let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
        match run(&config).await? {
            Exit::Restart => tracing::info!("Restarting pipeline"),
            Exit::Quit => break,
        }
    }

    tracing::info!("Pulse Relay stopped");
    Ok(())
}

async fn run(config: &AppConfig) -> Result<Exit> {
    let mut relay = Relay::start(config, Arc::new(SystemClock)).context("Failed to start relay")?;

    let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
    let api_handle = if config.api.enabled {
        let server = ApiServer::new(config.api.clone(), relay.hub());
        Some(server.start_background(api_shutdown_rx))
    } else {
        None
    };

    tracing::info!("Waiting for sensor data on {} - press Ctrl+C to stop", relay.ingest_addr());

    let exit = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("Ctrl+C handler failed: {}", e);
                }
                break Exit::Quit;
            }
            command = relay.next_admin() => match command {
                Some(AdminCommand::Stats) => relay.hub().log_snapshot(),
                Some(AdminCommand::Restart) => break Exit::Restart,
                None => break Exit::Quit,
            },
        }
    };

    let _ = api_shutdown_tx.send(true);
    if let Some(handle) = api_handle {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    let snapshot = relay.shutdown().await;
    println!("\n=== Final Statistics ===");
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize statistics")?
    );

    Ok(exit)
}
