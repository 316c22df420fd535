//! usbfs-probe
//!
//! Command-line companion to the usbfs host transport. Lists the devices the
//! transport can see, shows where the device tree lives, reads string
//! descriptors, keeps devices awake and dumps input from an endpoint.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{DeviceFilter, HostConfig, setup_logging};
use protocol::{EndpointInfo, hex_dump};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use usbhost::{DeviceHandle, InputEvent, UsbHost};

#[derive(Parser, Debug)]
#[command(name = "usbfs-probe")]
#[command(author, version, about = "Inspect USB devices through usbfs")]
#[command(long_about = "
Talks to USB devices through the Linux usbfs device nodes, the same way a
user-space peripheral driver built on the usbhost crate does.

EXAMPLES:
    # List devices
    usbfs-probe list

    # Show the usbfs device root
    usbfs-probe root

    # Read the product string of the first matching device
    usbfs-probe string --device 0x1c71:* 2

    # Dump 20 reports from interrupt endpoint 0x81 of interface 0
    usbfs-probe watch --device 0x1c71:0xc005 --endpoint 0x81 --count 20

CONFIGURATION:
    Configuration is read from, in order:
    1. Path specified with --config
    2. ~/.config/usbfs-host/host.toml
    3. /etc/usbfs-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List USB devices
    List,
    /// Show the usbfs device root
    Root,
    /// Read a string descriptor
    #[command(name = "string")]
    ReadString {
        /// Device filter (VID:PID, either may be `*`)
        #[arg(short, long, value_name = "FILTER")]
        device: Option<String>,
        /// String descriptor index
        index: u8,
    },
    /// Keep a device from being autosuspended
    Autosuspend {
        /// Device filter (VID:PID, either may be `*`)
        #[arg(short, long, value_name = "FILTER")]
        device: Option<String>,
    },
    /// Print input from an endpoint as it arrives
    Watch {
        /// Device filter (VID:PID, either may be `*`)
        #[arg(short, long, value_name = "FILTER")]
        device: Option<String>,
        /// Interface to claim
        #[arg(short, long, default_value_t = 0)]
        interface: u8,
        /// Input endpoint address (e.g. 0x81)
        #[arg(short, long, value_parser = parse_byte)]
        endpoint: u8,
        /// Treat the endpoint as bulk rather than interrupt
        #[arg(long)]
        bulk: bool,
        /// wMaxPacketSize of the endpoint
        #[arg(long, default_value_t = 64)]
        max_packet: u16,
        /// Stop after this many buffers
        #[arg(long)]
        count: Option<usize>,
    },
}

fn parse_byte(value: &str) -> std::result::Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", value, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = HostConfig::default_path();
        HostConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => HostConfig::load_from(path).context("Failed to load configuration")?,
        None => HostConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;
    info!("usbfs-probe v{}", env!("CARGO_PKG_VERSION"));

    let mut host = UsbHost::new(&config).context("Failed to set up USB host")?;

    match args.command.unwrap_or(Command::List) {
        Command::List => list_devices(&mut host),
        Command::Root => show_root(&mut host),
        Command::ReadString { device, index } => {
            let mut handle = open_device(&mut host, device.as_deref())?;
            let text = handle
                .read_string(index)
                .with_context(|| format!("Failed to read string descriptor {}", index))?;
            println!("{}", text);
            Ok(())
        }
        Command::Autosuspend { device } => {
            let handle = open_device(&mut host, device.as_deref())?;
            if !handle.disable_autosuspend() {
                bail!(
                    "Could not disable autosuspend for {}",
                    handle.host().usbfs_path().display()
                );
            }
            println!("Autosuspend disabled for {}", handle.host().usbfs_path().display());
            Ok(())
        }
        Command::Watch {
            device,
            interface,
            endpoint,
            bulk,
            max_packet,
            count,
        } => {
            let info = if bulk {
                EndpointInfo::bulk(endpoint, max_packet)
            } else {
                EndpointInfo::interrupt(endpoint, max_packet, 10)
            };
            let handle = open_device(&mut host, device.as_deref())?;
            watch(handle, interface, info, count)
        }
    }
}

fn list_devices(host: &mut UsbHost) -> Result<()> {
    let devices = host.devices();
    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let descriptor = device.descriptor();
        println!(
            "  {:04x}:{:04x}  {}",
            device.vendor_id(),
            device.product_id(),
            device.usbfs_path().display()
        );
        println!(
            "      USB {:x}.{:02x} class {:#04x} configurations {}",
            descriptor.usb_version >> 8,
            descriptor.usb_version & 0xff,
            descriptor.class,
            descriptor.num_configurations
        );
        if let Some(sysfs) = device.sysfs_path() {
            println!("      sysfs: {}", sysfs.display());
        }
    }
    Ok(())
}

fn show_root(host: &mut UsbHost) -> Result<()> {
    let root: PathBuf = host
        .device_root()
        .ok_or_else(|| anyhow!("No usbfs device root found"))?;
    println!("{}", root.display());
    Ok(())
}

/// First device matching `filter`, else the first passing the configured
/// filters
fn open_device(host: &mut UsbHost, filter: Option<&str>) -> Result<DeviceHandle> {
    let handle = match filter {
        Some(filter) => {
            let filter = DeviceFilter::parse(filter)?;
            host.find_device(|handle| {
                let descriptor = handle.descriptor();
                filter.matches(descriptor.vendor_id, descriptor.product_id)
            })
        }
        None => host.find_matching(|_| true),
    };

    let mut handle = handle.ok_or_else(|| anyhow!("No matching USB device"))?;
    handle
        .ensure_open()
        .with_context(|| format!("Failed to open {}", handle.host().usbfs_path().display()))?;
    info!("Using {}", handle.host().usbfs_path().display());
    Ok(handle)
}

fn watch(mut handle: DeviceHandle, interface: u8, endpoint: EndpointInfo, count: Option<usize>) -> Result<()> {
    handle
        .claim_interface(interface)
        .with_context(|| format!("Failed to claim interface {}", interface))?;

    let limit = count.unwrap_or(usize::MAX);
    let mut seen = 0;
    handle.monitor_input(endpoint, move |address, event| match event {
        InputEvent::Data(data) => {
            println!("{}: [{}]", address, hex_dump(data));
            seen += 1;
            seen < limit
        }
        InputEvent::Failed(e) => {
            warn!("Input from {} failed: {}", address, e);
            false
        }
    })?;

    while handle.is_monitoring(endpoint.address) {
        handle
            .process_events(Duration::from_millis(500))
            .context("Monitoring input failed")?;
    }

    handle.close();
    Ok(())
}
