use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

use volume_connector::{
    CommandExecutor, ConnectorConfig, ConnectorContext, DeviceInfo, HostLayout, PollPolicy,
    check_valid_device, new_connector,
};

#[derive(Parser, Debug)]
#[command(name = "volume-connector")]
#[command(about = "Attach and detach iSCSI, Ceph RBD and local LVM volumes on this host")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Root of the sysfs tree
    #[arg(long, env = "SYS_ROOT", default_value = "/sys")]
    sys_root: PathBuf,

    /// Root of the device tree
    #[arg(long, env = "DEV_ROOT", default_value = "/dev")]
    dev_root: PathBuf,

    /// Ceph configuration directory (cluster keyrings)
    #[arg(long, env = "CEPH_CONF_DIR", default_value = "/etc/ceph")]
    ceph_conf_dir: PathBuf,

    /// Directory for ephemeral Ceph keyring/conf files (defaults to the system temp dir)
    #[arg(long, env = "VOLUME_CONNECTOR_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Seconds to wait for removed SCSI devices to disappear
    #[arg(long, env = "REMOVAL_ATTEMPTS", default_value = "10")]
    removal_attempts: u32,

    /// Seconds to wait for new devices and links to appear
    #[arg(long, env = "DEVICE_WAIT_ATTEMPTS", default_value = "10")]
    device_wait_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct VolumeArgs {
    /// Storage protocol (iscsi, rbd, local)
    #[arg(long, env = "VOLUME_PROTOCOL")]
    protocol: String,

    /// JSON connection properties file, or '-' for stdin
    #[arg(long, default_value = "-")]
    properties: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach the volume and print its device info as JSON
    Connect(VolumeArgs),
    /// Detach a volume previously attached with `connect`
    Disconnect {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Device info JSON printed by `connect` (inline or a file path)
        #[arg(long)]
        device_info: Option<String>,
    },
    /// Print the current size of the attached volume in bytes
    Extend(VolumeArgs),
    /// Print the expected device path without touching the host
    DevicePath(VolumeArgs),
    /// Check that a device path exists (and is readable)
    CheckDevice {
        path: PathBuf,
        #[arg(long)]
        require_readable: bool,
    },
}

fn read_properties(source: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source)
            .map_err(|e| format!("Failed to read properties '{}': {}", source, e))?
    };
    Ok(serde_json::from_str(&raw)?)
}

fn read_device_info(source: &str) -> Result<DeviceInfo, Box<dyn std::error::Error>> {
    let raw = if source.trim_start().starts_with('{') {
        source.to_string()
    } else {
        std::fs::read_to_string(source)
            .map_err(|e| format!("Failed to read device info '{}': {}", source, e))?
    };
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the JSON result only
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ConnectorConfig {
        layout: HostLayout {
            sys_root: args.sys_root.clone(),
            dev_root: args.dev_root.clone(),
            ceph_conf_dir: args.ceph_conf_dir.clone(),
        },
        temp_dir: args.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        removal: PollPolicy::new(args.removal_attempts, Duration::from_secs(1)),
        device_wait: PollPolicy::new(args.device_wait_attempts, Duration::from_secs(1)),
    };
    debug!(?config, "Connector configuration");
    let ctx = ConnectorContext::new(config, Arc::new(CommandExecutor::new()));

    match args.command {
        Command::Connect(volume) => {
            let connector = new_connector(&volume.protocol, read_properties(&volume.properties)?, ctx)?;
            let info = connector.connect_volume().await?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Command::Disconnect {
            volume,
            device_info,
        } => {
            let connector = new_connector(&volume.protocol, read_properties(&volume.properties)?, ctx)?;
            let info = match device_info {
                Some(source) => read_device_info(&source)?,
                None => DeviceInfo::block(connector.device_path()),
            };
            connector.disconnect_volume(&info).await?;
            info!(path = %info.path, "Volume disconnected");
        }
        Command::Extend(volume) => {
            let connector = new_connector(&volume.protocol, read_properties(&volume.properties)?, ctx)?;
            let size = connector.extend_volume().await?;
            println!("{}", json!({ "size": size }));
        }
        Command::DevicePath(volume) => {
            let connector = new_connector(&volume.protocol, read_properties(&volume.properties)?, ctx)?;
            println!("{}", json!({ "path": connector.device_path() }));
        }
        Command::CheckDevice {
            path,
            require_readable,
        } => {
            let valid = check_valid_device(&path, require_readable);
            println!("{}", json!({ "path": path, "valid": valid }));
            if !valid {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
