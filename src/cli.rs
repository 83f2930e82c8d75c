//! Command-line interface

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use arpsentry::config::Config;
use arpsentry::engine::{create_source, CaptureMethod, Engine, ResponseMode};

#[derive(Parser)]
#[command(
    name = "arpsentry",
    version,
    about = "Passive ARP spoofing and gateway impersonation detection"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Force debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Observe an interface; detection and alerting only, no actions
    Monitor {
        /// Interface to capture on
        #[arg(short, long)]
        interface: Option<String>,

        /// Replay a pcap file instead of capturing live
        #[arg(long)]
        pcap_file: Option<PathBuf>,
    },

    /// Observe with active-response hooks enabled
    Protect {
        /// Interface to capture on
        #[arg(short, long)]
        interface: String,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Monitor {
            interface,
            pcap_file,
        } => run_engine(config, interface, pcap_file, ResponseMode::Monitor).await,
        Commands::Protect { interface } => {
            run_engine(config, Some(interface), None, ResponseMode::Protect).await
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("configuration ok");
            Ok(())
        }
    }
}

async fn run_engine(
    mut config: Config,
    interface: Option<String>,
    pcap_file: Option<PathBuf>,
    mode: ResponseMode,
) -> Result<()> {
    if let Some(path) = pcap_file {
        config.capture.method = CaptureMethod::File;
        config.capture.pcap_file = Some(path);
    } else if let Some(iface) = interface {
        config.capture.method = CaptureMethod::Live;
        config.capture.interface = Some(iface.clone());
    }

    // Missing capture privilege or device is a fatal startup error
    let source = create_source(&config.capture)?;
    let mut engine = Engine::new(config, mode)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    engine.run(source, shutdown).await
}
