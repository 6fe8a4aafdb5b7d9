//! usb-printer
//!
//! Command-line front end for the printer adapter: list attached printers,
//! send a job, query status bytes, or watch lifecycle events.

mod config;
mod logging;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use config::{CliConfig, parse_hex_id};
use logging::setup_logging;
use printer::{
    AdapterEvent, DeviceSelector, HostDevice, PrinterAdapter, RusbHost, find_printers,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-printer")]
#[command(author, version, about = "Send raw jobs to a USB printer")]
#[command(long_about = "
Drive a USB printer as a raw byte stream.

EXAMPLES:
    # List attached printers
    usb-printer list

    # Print a file on the first attached printer
    usb-printer print receipt.bin

    # Print from stdin on a specific printer
    cat job.prn | usb-printer --vendor-id 0x04b8 --product-id 0x0e15 print

    # Watch connect/detach events
    usb-printer watch --log-level debug

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-printer/config.toml
    3. /etc/usb-printer/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Vendor ID in hex (e.g. 0x04b8)
    #[arg(long, value_name = "ID", global = true)]
    vendor_id: Option<String>,

    /// Product ID in hex (e.g. 0x0e15)
    #[arg(long, value_name = "ID", global = true)]
    product_id: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached printers
    List,
    /// Send FILE (or stdin) to the printer
    Print {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Read one status frame from the printer
    Status,
    /// Log printer events until Ctrl-C or detach
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let Some(command) = args.command else {
        return Err(anyhow!("No command given, see --help"));
    };

    let host = Arc::new(RusbHost::new().context("Failed to initialize libusb")?);

    match command {
        Command::List => list_printers(&host),
        Command::Print { file } => {
            let adapter = open_adapter(host, &args.vendor_id, &args.product_id, &config).await?;
            let result = print_job(&adapter, file).await;
            close_adapter(&adapter).await;
            result
        }
        Command::Status => {
            let adapter = open_adapter(host, &args.vendor_id, &args.product_id, &config).await?;
            let result = show_status(&adapter).await;
            close_adapter(&adapter).await;
            result
        }
        Command::Watch => {
            let adapter = open_adapter(host, &args.vendor_id, &args.product_id, &config).await?;
            let result = watch_events(&adapter).await;
            close_adapter(&adapter).await;
            result
        }
    }
}

fn list_printers(host: &RusbHost) -> Result<()> {
    let printers = find_printers(host).context("Failed to enumerate USB devices")?;

    if printers.is_empty() {
        println!("No USB printers found.");
    } else {
        println!("Found {} USB printer(s):\n", printers.len());
        for device in printers {
            let key = device.key();
            println!("  {:04x}:{:04x}", key.vendor_id, key.product_id);
            println!("      Bus {:03} Device {:03}", key.bus, key.address);
            if let Ok(interfaces) = device.interfaces() {
                for iface in interfaces {
                    println!(
                        "      Interface {}: {:?}, {} bulk endpoint(s)",
                        iface.number,
                        iface.class,
                        iface.endpoints.len()
                    );
                }
            }
            println!();
        }
    }

    Ok(())
}

/// Select and open the printer named on the command line or in config
async fn open_adapter(
    host: Arc<RusbHost>,
    vendor_id: &Option<String>,
    product_id: &Option<String>,
    config: &CliConfig,
) -> Result<PrinterAdapter<RusbHost>> {
    let ids = match (vendor_id, product_id) {
        (Some(vid), Some(pid)) => Some((
            parse_hex_id(vid, "vendor ID")?,
            parse_hex_id(pid, "product ID")?,
        )),
        (None, None) => config.printer_ids()?,
        _ => return Err(anyhow!("--vendor-id and --product-id must be given together")),
    };

    let selector = DeviceSelector::from_ids(ids.map(|(v, _)| v), ids.map(|(_, p)| p));
    let adapter = PrinterAdapter::new(host, selector, config.transfer.clone())
        .context("Failed to select printer")?;

    adapter.open().await.context("Failed to open printer")?;
    Ok(adapter)
}

async fn close_adapter(adapter: &PrinterAdapter<RusbHost>) {
    if let Err(e) = adapter.close().await {
        warn!("Failed to close printer {}: {}", adapter.key(), e);
    }
}

async fn print_job(adapter: &PrinterAdapter<RusbHost>, file: Option<PathBuf>) -> Result<()> {
    let data = match file {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => tokio::task::spawn_blocking(|| {
            let mut buffer = Vec::new();
            std::io::stdin().read_to_end(&mut buffer).map(|_| buffer)
        })
        .await?
        .context("Failed to read stdin")?,
    };

    let written = adapter.write(&data).await.context("Failed to send job")?;
    info!("Sent {} of {} bytes to {}", written, data.len(), adapter.key());
    if written < data.len() {
        return Err(anyhow!(
            "Printer accepted only {} of {} bytes",
            written,
            data.len()
        ));
    }
    Ok(())
}

async fn show_status(adapter: &PrinterAdapter<RusbHost>) -> Result<()> {
    let frame = adapter.read().await.context("Failed to read status")?;

    if frame.is_empty() {
        println!("No status data pending.");
    } else {
        let hex: Vec<String> = frame.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{}", hex.join(" "));
    }
    Ok(())
}

async fn watch_events(adapter: &PrinterAdapter<RusbHost>) -> Result<()> {
    let events = adapter.events();
    info!("Watching {} (Ctrl-C to stop)", adapter.key());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => {
                let Ok(event) = event else {
                    return Ok(());
                };
                match event {
                    AdapterEvent::Connect(key) => info!("Connected: {}", key),
                    AdapterEvent::Disconnect(key) => {
                        info!("Disconnected: {}", key);
                        return Ok(());
                    }
                    AdapterEvent::Detach(key) => info!("Detached: {}", key),
                    AdapterEvent::Close(key) => info!("Closed: {}", key),
                    AdapterEvent::Data(data) => info!("Data: {} bytes", data.len()),
                }
            }
        }
    }
}
