//! netmount demo node
//!
//! Runs a master and a slave for one device inside a single process and
//! prints what the slave saw.
//!
//! Usage:
//!   netmount-node --device-name core-1 --source ietf-interfaces --source ietf-system

use anyhow::{Context, Result};
use clap::Parser;
use netmount_cluster::MountConfig;
use netmount_node::{DemoOptions, run_demo};
use netmount_types::{DeviceId, SourceId};
use std::{fs, net::SocketAddr, path::PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "netmount-node")]
#[command(about = "Clustered device mount demo node")]
struct Args {
    /// Device name
    #[arg(short, long, default_value = "demo-device")]
    device_name: String,

    /// Device address
    #[arg(short, long, default_value = "127.0.0.1:830")]
    address: SocketAddr,

    /// Schema sources the device uses, as name or name@revision
    #[arg(short, long = "source", default_values = ["ietf-interfaces", "ietf-system"])]
    sources: Vec<SourceId>,

    /// Path to a JSON mount configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle timeout of transaction proxies, overrides the config file
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Reply timeout of every ask, overrides the config file
    #[arg(long)]
    ask_timeout_ms: Option<u64>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<MountConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading mount configuration from {:?}", path);
            let json = fs::read_to_string(path).context("Failed to read config file")?;
            MountConfig::from_json(&json).context("Failed to parse config file")?
        }
        None => MountConfig::default(),
    };
    if let Some(ms) = args.idle_timeout_ms {
        config.idle_timeout_ms = ms;
    }
    if let Some(ms) = args.ask_timeout_ms {
        config.ask_timeout_ms = ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("netmount node starting...");
    let options = DemoOptions {
        device: DeviceId::new(args.device_name.clone(), args.address),
        sources: args.sources.clone(),
        config: load_config(&args)?,
    };

    let report = run_demo(options).await?;

    println!("\n========================================");
    println!("  netmount demo finished");
    println!("========================================");
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("========================================\n");

    Ok(())
}
