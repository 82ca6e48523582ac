//! VeilNet Daemon
//!
//! The veild daemon provides:
//! - a SOCKS5 front end that tunnels connections through circuits
//! - a relay listener (relay and bridge modes)
//! - hidden-service hosting behind a relay (`relay.hidden_service_target`)
//!
//! # Usage
//!
//! ```bash
//! # Generate a relay identity
//! veild --data-dir ./relay1 keygen
//!
//! # Run a relay
//! veild --mode relay --listen 127.0.0.1:9001 --data-dir ./relay1
//!
//! # Run a client with a directory file
//! veild --directory ./directory.json --socks 127.0.0.1:9050
//! ```

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use veilnet::config::NodeMode;
use veilnet::prelude::*;
use veilnet::socks::SocksServer;

/// VeilNet - onion-routing overlay daemon
#[derive(Parser)]
#[command(name = "veild")]
#[command(author = "VeilNet Contributors")]
#[command(version)]
#[command(about = "VeilNet client and relay daemon", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true, env = "VEILNET_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, value_name = "DIR", global = true, env = "VEILNET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node mode (client, relay, bridge)
    #[arg(short, long, global = true)]
    mode: Option<String>,

    /// SOCKS5 listen address
    #[arg(long, value_name = "ADDR", global = true)]
    socks: Option<SocketAddr>,

    /// Relay listen address
    #[arg(long, value_name = "ADDR", global = true)]
    listen: Option<SocketAddr>,

    /// Relay directory JSON file
    #[arg(long, value_name = "FILE", global = true)]
    directory: Option<PathBuf>,

    /// Service an empty CONNECT reaches ("host:port")
    #[arg(long, value_name = "ADDR", global = true)]
    hidden_target: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,
    /// Check configuration
    Check,
    /// Generate a relay identity key
    Keygen {
        /// Private key file (defaults to the configured key path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// RSA modulus size
        #[arg(long)]
        bits: Option<usize>,

        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Setup logging
    let log_level = log_filter(cli.verbose, &config);
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)))
        .init();

    match cli.command {
        Some(Commands::Check) => check_config(&config),
        Some(Commands::Keygen { output, bits, force }) => {
            run_keygen(&config, output, bits, force)?
        }
        Some(Commands::Run) | None => run_daemon(config).await?,
    }

    Ok(())
}

/// `-v` flags win over the configured level
fn log_filter(verbose: u8, config: &VeilConfig) -> String {
    match verbose {
        0 => config.log_level.clone(),
        1 => "debug".into(),
        _ => "trace".into(),
    }
}

fn load_config(cli: &Cli) -> VeilResult<VeilConfig> {
    let mut config = match &cli.config {
        Some(path) => VeilConfig::load(path)?,
        None => VeilConfig::default(),
    };

    // Override with CLI args
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(mode) = &cli.mode {
        config.mode = parse_mode(mode)?;
    }
    if let Some(socks) = cli.socks {
        config.socks_addr = Some(socks);
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = Some(listen);
    }
    if let Some(directory) = &cli.directory {
        config.directory_file = Some(directory.clone());
    }
    if let Some(target) = &cli.hidden_target {
        config.relay.hidden_service_target = Some(target.clone());
    }
    if config.mode == NodeMode::Relay {
        config.socks_addr = None;
    }

    config.validate()?;
    Ok(config)
}

fn parse_mode(mode: &str) -> VeilResult<NodeMode> {
    match mode.to_ascii_lowercase().as_str() {
        "client" => Ok(NodeMode::Client),
        "relay" => Ok(NodeMode::Relay),
        "bridge" => Ok(NodeMode::Bridge),
        other => Err(VeilError::InvalidConfiguration(format!(
            "unknown mode {:?} (client, relay, bridge)",
            other
        ))),
    }
}

fn check_config(config: &VeilConfig) {
    println!("Configuration check:");
    println!("  Mode:            {:?}", config.mode);
    println!("  Data dir:        {}", config.data_dir.display());
    println!("  SOCKS addr:      {:?}", config.socks_addr);
    println!("  Listen addr:     {:?}", config.listen_addr);
    println!("  Directory:       {}", config.directory_path().display());
    println!("  Hidden services: {}", config.hidden_services_path().display());
    println!("  Circuit hops:    {}", config.circuit.hops);
    println!("  Idle TTL:        {:?}", config.relay.idle_ttl);
    if config.mode.runs_relay() {
        println!("  Relay key:       {}", config.key_path().display());
    }
    println!();
    println!("Configuration OK!");
}

/// Generate and save a relay key pair
fn run_keygen(
    config: &VeilConfig,
    output: Option<PathBuf>,
    bits: Option<usize>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = output.unwrap_or_else(|| config.key_path());
    if path.exists() && !force {
        return Err(format!("{} exists (use --force to replace)", path.display()).into());
    }

    let bits = bits.unwrap_or(config.relay.key_bits);
    println!("Generating {}-bit relay key...", bits);
    let keys = RelayKeyPair::generate(bits)?;
    let public_path = keys.save_pem(&path)?;
    print_identity(&keys, &path, &public_path)?;
    Ok(())
}

fn print_identity(
    keys: &RelayKeyPair,
    private_path: &Path,
    public_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let der = keys.public_key_der()?;
    println!("  Relay ID:        {}", keys.relay_id()?.to_hex());
    println!("  Hidden address:  {}", HiddenAddress::from_public_key(&der));
    println!("  Private key:     {}", private_path.display());
    println!("  Public key:      {}", public_path.display());
    Ok(())
}

/// Load the relay key, creating one on first start
fn relay_keys(config: &VeilConfig) -> VeilResult<RelayKeyPair> {
    let path = config.key_path();
    if path.exists() {
        return RelayKeyPair::load_pem(&path);
    }
    info!("No relay key at {}, generating one", path.display());
    let keys = RelayKeyPair::generate(config.relay.key_bits)?;
    keys.save_pem(&path)?;
    Ok(keys)
}

fn relay_directory(config: &VeilConfig) -> VeilResult<InMemoryRelayRepository> {
    let path = config.directory_path();
    if !path.exists() {
        warn!("No relay directory at {}; circuits cannot be built", path.display());
        return Ok(InMemoryRelayRepository::new());
    }
    let relays = InMemoryRelayRepository::load_json(&path)?;
    info!("Loaded {} relays from {}", relays.len(), path.display());
    Ok(relays)
}

fn hidden_services(config: &VeilConfig) -> VeilResult<InMemoryHiddenServiceRepository> {
    let path = config.hidden_services_path();
    if !path.exists() {
        return Ok(InMemoryHiddenServiceRepository::new());
    }
    InMemoryHiddenServiceRepository::load_json(&path)
}

async fn wait_for(task: Option<JoinHandle<VeilResult<()>>>) -> VeilResult<()> {
    match task {
        Some(task) => task
            .await
            .map_err(|e| VeilError::Internal(format!("task failed: {}", e)))?,
        None => std::future::pending().await,
    }
}

/// Run the daemon
async fn run_daemon(config: VeilConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting VeilNet daemon ({:?} mode)...", config.mode);
    config.prepare_data_dir()?;

    let mut relay_task = None;
    if config.mode.runs_relay() {
        let listen_addr = config
            .listen_addr
            .ok_or_else(|| VeilError::MissingConfiguration("listen address".into()))?;
        let keys = relay_keys(&config)?;
        let server = RelayServer::bind(listen_addr, &config.relay, keys).await?;
        info!("Relay descriptor: {}", serde_json::to_string(&server.descriptor()?)?);
        relay_task = Some(server.spawn());
    }

    let mut socks_task = None;
    if config.mode.runs_client() {
        let socks_addr = config
            .socks_addr
            .ok_or_else(|| VeilError::MissingConfiguration("SOCKS address".into()))?;
        let client = VeilClient::new(
            config.circuit.clone(),
            Arc::new(relay_directory(&config)?),
            Arc::new(InMemoryCircuitRepository::new()),
            Arc::new(hidden_services(&config)?),
        );
        let server = SocksServer::bind(socks_addr, Arc::new(client), config.circuit.hops).await?;
        socks_task = Some(server.spawn());
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
        result = wait_for(relay_task) => result?,
        result = wait_for(socks_task) => result?,
    }

    info!("Daemon stopped.");
    Ok(())
}
