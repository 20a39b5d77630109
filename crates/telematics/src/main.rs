//! Telematics Unit - Main Entry Point

use std::path::PathBuf;
use telematics::{build_peripherals, init_logging, Session, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TelemetryConfig::load(config_path.as_deref())?;
    init_logging(&config.logging)?;

    info!("=== Telematics Unit v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Device {} -> {}:{} ({:?} link{})",
        config.device_id,
        config.server.host,
        config.server.port,
        config.link.kind,
        if config.simulate { ", simulated sensors" } else { "" }
    );

    let peripherals = build_peripherals(&config);
    let mut session = Session::new(config, peripherals);

    // Local console: one command per line on stdin
    let (console_tx, console_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if console_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            // keep the sender alive so the session is not stopped
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(());
    });

    session.run(console_rx, shutdown_rx).await;
    Ok(())
}
