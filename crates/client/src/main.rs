//! AirUSB client
//!
//! Lists and attaches USB devices exported by an AirUSB server.

use anyhow::{bail, Context, Result};
use clap::Parser;
use client::UsbClient;
use common::{install_interrupt_handler, interrupted, setup_logging};
use protocol::DEFAULT_PORT;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "airusb-client")]
#[command(author, version, about = "AirUSB client - use remote USB devices locally")]
struct Args {
    /// Server host name or IP address
    server: String,

    /// Server TCP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// List available devices
    #[arg(short, long)]
    list: bool,

    /// Attach a device by busid (e.g. 2-2)
    #[arg(short, long, value_name = "BUSID")]
    attach: Option<String>,

    /// Detach a device by id
    #[arg(short, long, value_name = "ID")]
    detach: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).context("Failed to setup logging")?;

    let mut session = UsbClient::connect((args.server.as_str(), args.port))
        .with_context(|| format!("Failed to connect to {}:{}", args.server, args.port))?;

    if args.list {
        let devices = session.list_devices().context("Device list failed")?;
        if devices.is_empty() {
            println!("No devices found");
        } else {
            for device in &devices {
                println!(
                    "busid {:<12} ({:04x}:{:04x})",
                    device.busid, device.vendor_id, device.product_id
                );
                println!(
                    "    {} : {}",
                    non_empty(&device.manufacturer, "Unknown Manufacturer"),
                    non_empty(&device.product, "Unknown Product"),
                );
            }
        }
    }

    if let Some(busid) = &args.attach {
        attach_device(&mut session, busid)?;
    }

    if let Some(device_id) = args.detach {
        if session.detach(device_id).context("Detach failed")? {
            println!("Device {} detached", device_id);
        }
    }

    session.disconnect();
    Ok(())
}

fn attach_device(session: &mut UsbClient, busid: &str) -> Result<()> {
    let devices = session.list_devices().context("Device list failed")?;
    let record = devices
        .iter()
        .find(|d| d.busid == busid)
        .with_context(|| format!("Device with busid {} not found", busid))?
        .clone();

    info!(device_id = record.device_id, busid, "Attaching device");
    let device = session
        .attach(&record)
        .with_context(|| format!("Failed to attach device {}", busid))?;

    session
        .start_reader()
        .context("Failed to start completion reader")?;

    println!(
        "Device {} ({}) attached; press Ctrl+C to detach",
        record.device_id, busid
    );

    install_interrupt_handler();
    while !interrupted() {
        if !device.is_connected() {
            bail!("Connection to server lost");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    println!("\nDetaching device...");
    session.disconnect();
    Ok(())
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
