//! AirUSB server
//!
//! Exports USB devices attached to this host so clients on the local
//! network can use them as if they were plugged in locally.

mod config;
mod net;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{install_interrupt_handler, setup_logging, wait_for_interrupt};
use config::ServerConfig;
use net::server::UsbServer;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "airusb-server")]
#[command(author, version, about = "AirUSB server - share USB devices over the network")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Address to listen on (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// TCP port to listen on (overrides config)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.clone()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }

    setup_logging(&config.server.log_level).context("Failed to setup logging")?;
    info!("AirUSB server v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices();
    }

    let server = Arc::new(UsbServer::bind(&config)?);

    let accept_handle = {
        let server = Arc::clone(&server);
        std::thread::Builder::new()
            .name("accept".to_string())
            .spawn(move || server.run())
            .context("Failed to spawn accept thread")?
    };

    install_interrupt_handler();
    wait_for_interrupt();

    info!("Interrupt received, shutting down");
    server.stop();
    let _ = accept_handle.join();
    Ok(())
}

fn list_devices() -> Result<()> {
    let inventory = usb::inventory::Inventory::new().context("Failed to initialize USB backend")?;
    inventory.scan().context("Failed to scan USB devices")?;

    let devices = inventory.list();
    if devices.is_empty() {
        println!("No exportable USB devices found");
        return Ok(());
    }

    for record in devices {
        println!(
            "busid {:<12} ({:04x}:{:04x})",
            record.busid, record.vendor_id, record.product_id
        );
        println!(
            "    {} : {}",
            non_empty(&record.manufacturer, "Unknown Manufacturer"),
            non_empty(&record.product, "Unknown Product"),
        );
    }
    Ok(())
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
