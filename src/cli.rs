use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::authlog::start_auth_log_monitoring;
use crate::capture::{spawn_capture_thread, FileSource, LiveSource, PacketSource};
use crate::classifier::HeuristicClassifier;
use crate::config::Config;
use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "flowsentry")]
#[command(about = "Real-time hybrid network intrusion detection", version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture live traffic and detect attacks
    Run {
        /// Interface to capture on (overrides config)
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Replay a pcap file through the detection pipeline
    Replay {
        /// Path to the pcap file
        file: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Execute the selected command
pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Run { interface } => {
            if interface.is_some() {
                config.capture.interface = interface;
            }
            let source = LiveSource::open(&config.capture)?;
            run_pipeline(config, Box::new(source), true).await
        }

        Commands::Replay { file } => {
            let source = FileSource::open(&file)?;
            run_pipeline(config, Box::new(source), false).await
        }

        Commands::Config => {
            let toml = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", toml);
            Ok(())
        }
    }
}

/// Assemble and run the full pipeline on a packet source.
async fn run_pipeline(config: Config, source: Box<dyn PacketSource>, live: bool) -> Result<()> {
    let mut engine = Engine::new(config.clone(), Arc::new(HeuristicClassifier))?;
    let snapshot = engine.snapshot();

    // Log emitted alerts; storage/email collaborators subscribe the same way
    let mut alert_rx = engine.subscribe_alerts();
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            info!("ALERT {}", alert);
        }
    });

    let (packet_tx, packet_rx) = mpsc::channel(config.capture.channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Auth log monitoring only makes sense against a live system
    if live && !config.auth_logs.is_empty() {
        let logs = config.auth_logs.clone();
        tokio::spawn(async move {
            if let Err(e) = start_auth_log_monitoring(logs, event_tx).await {
                warn!("Auth log monitoring stopped: {}", e);
            }
        });
    }

    let capture_handle = spawn_capture_thread(source, packet_tx);

    // Ctrl-C triggers graceful shutdown
    let ctrlc_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            let _ = ctrlc_shutdown.send(());
        }
    });

    engine.run(packet_rx, event_rx, shutdown_rx).await?;

    let snap = snapshot.read();
    info!(
        "Done. {} flows classified, {} alerts, {} suppressed",
        snap.flows_classified,
        snap.alerts.len(),
        snap.alerts_suppressed
    );

    drop(shutdown_tx);
    capture_handle.join().ok();
    Ok(())
}
