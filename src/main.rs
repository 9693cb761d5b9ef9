//! Binary entry point: load configuration, discover or open the serial
//! port, start the orchestrator, and run until `Ctrl-C`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use penplot_core::config::DeviceOptions;
use penplot_core::error::CoreError;
use penplot_core::orchestrator;
use penplot_core::protocol::{Serial2Port, SerialPort};

const BAUD_RATE: u32 = 9600;

#[derive(Parser, Debug)]
#[command(name = "penplotd", about = "Motion-control core for a CoreXY pen-plotter")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "penplot.toml")]
    config: PathBuf,

    /// Serial port path. Auto-discovered by descriptor/VID:PID when absent.
    #[arg(short, long)]
    port: Option<String>,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), CoreError> {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("starting pen-plotter motion core");

    let options = DeviceOptions::load(&cli.config)?;
    tracing::info!(model = %options.model, timeslice_ms = options.timeslice_ms, "configuration loaded");

    let port_path = match cli.port {
        Some(p) => p,
        None => {
            tracing::info!("no port given, discovering device");
            Serial2Port::discover()?
        }
    };
    tracing::info!(port = %port_path, "opening serial port");
    let port: Arc<dyn SerialPort> = Arc::new(Serial2Port::open(&port_path, BAUD_RATE)?);

    let handle = orchestrator::spawn(options, port);
    tracing::info!("orchestrator running, press Ctrl-C to shut down");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to wait for shutdown signal");
    }

    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
