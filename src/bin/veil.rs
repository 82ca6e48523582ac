//! VeilNet CLI
//!
//! Offline tooling: hidden-service addresses, configuration files and the
//! relay directory.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use veilnet::config::NodeMode;
use veilnet::crypto::keys::{public_key_from_pem, public_key_to_der};
use veilnet::hidden::HiddenServiceRecord;
use veilnet::prelude::*;

#[derive(Parser)]
#[command(name = "veil")]
#[command(author = "VeilNet Contributors")]
#[command(version)]
#[command(about = "VeilNet command-line tools")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hidden service tools
    #[command(subcommand)]
    Hidden(HiddenCommands),

    /// Configuration files
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Relay directory files
    #[command(subcommand)]
    Directory(DirectoryCommands),
}

#[derive(Subcommand)]
enum HiddenCommands {
    /// Print the .veil address of a public key
    Address {
        /// PKCS#1 PEM public key
        public_key: PathBuf,
    },
    /// Record which exit relay hosts a service
    Publish {
        /// Service PKCS#1 PEM public key
        public_key: PathBuf,
        /// Hosting relay id (hex)
        #[arg(long)]
        exit: String,
        /// Hidden-service records file
        #[arg(long, default_value = "hidden_services.json")]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration
    Init {
        /// Output file
        #[arg(default_value = "veilnet.json")]
        path: PathBuf,
        /// Node mode (client, relay, bridge)
        #[arg(long, default_value = "client")]
        mode: String,
        /// Relay listen address
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate and print a configuration
    Show {
        /// Configuration file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum DirectoryCommands {
    /// Add or replace a relay entry
    Add {
        /// Relay PKCS#1 PEM public key
        public_key: PathBuf,
        /// Address the relay listens on
        #[arg(long)]
        address: SocketAddr,
        /// Relay nickname
        #[arg(long, default_value = "unnamed")]
        nickname: String,
        /// Directory file
        #[arg(long, default_value = "directory.json")]
        file: PathBuf,
    },
    /// List relays in a directory file
    List {
        /// Directory file
        #[arg(long, default_value = "directory.json")]
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let result = match cli.command {
        Commands::Hidden(cmd) => handle_hidden(cmd),
        Commands::Config(cmd) => handle_config(cmd),
        Commands::Directory(cmd) => handle_directory(cmd),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Read a PEM public key and return its PKCS#1 DER form
fn read_public_key(path: &Path) -> VeilResult<Vec<u8>> {
    let pem = std::fs::read_to_string(path)?;
    public_key_to_der(&public_key_from_pem(&pem)?)
}

fn handle_hidden(cmd: HiddenCommands) -> VeilResult<()> {
    match cmd {
        HiddenCommands::Address { public_key } => {
            let der = read_public_key(&public_key)?;
            println!("{}", HiddenAddress::from_public_key(&der));
        }
        HiddenCommands::Publish {
            public_key,
            exit,
            file,
        } => {
            let record = HiddenServiceRecord::new(read_public_key(&public_key)?, RelayId::from_hex(&exit)?);
            let services = if file.exists() {
                InMemoryHiddenServiceRepository::load_json(&file)?
            } else {
                InMemoryHiddenServiceRepository::new()
            };
            let address = record.address;
            services.publish(record)?;
            services.save_json(&file)?;
            println!("Published {} ({} records in {})", address, services.len(), file.display());
        }
    }
    Ok(())
}

fn handle_config(cmd: ConfigCommands) -> VeilResult<()> {
    match cmd {
        ConfigCommands::Init {
            path,
            mode,
            listen,
            force,
        } => {
            if path.exists() && !force {
                return Err(VeilError::InvalidConfiguration(format!(
                    "{} exists (use --force to replace)",
                    path.display()
                )));
            }
            let listen = listen.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9001)));
            let config = match mode.to_ascii_lowercase().as_str() {
                "client" => VeilConfig::client(),
                "relay" => VeilConfig::relay(listen),
                "bridge" => VeilConfig::bridge(listen),
                other => {
                    return Err(VeilError::InvalidConfiguration(format!(
                        "unknown mode {:?}",
                        other
                    )))
                }
            };
            config.validate()?;
            config.save(&path)?;
            println!("Wrote {:?} configuration to {}", config.mode, path.display());
        }
        ConfigCommands::Show { path } => {
            let config = VeilConfig::load(&path)?;
            config.validate()?;
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| VeilError::Internal(e.to_string()))?;
            println!("{}", json);
            if config.mode == NodeMode::Client && config.listen_addr.is_some() {
                eprintln!("Note: listen_addr is ignored in client mode");
            }
        }
    }
    Ok(())
}

fn handle_directory(cmd: DirectoryCommands) -> VeilResult<()> {
    match cmd {
        DirectoryCommands::Add {
            public_key,
            address,
            nickname,
            file,
        } => {
            let descriptor =
                RelayDescriptor::from_public_key(nickname, address, read_public_key(&public_key)?);
            descriptor.validate()?;

            let relays = if file.exists() {
                InMemoryRelayRepository::load_json(&file)?
            } else {
                InMemoryRelayRepository::new()
            };
            let id = descriptor.id;
            relays.upsert(descriptor);
            relays.save_json(&file)?;
            println!("Added relay {} ({} relays in {})", id.to_hex(), relays.len(), file.display());
        }
        DirectoryCommands::List { file } => {
            let relays = InMemoryRelayRepository::load_json(&file)?;
            let mut all = relays.all();
            all.sort_by(|a, b| a.nickname.cmp(&b.nickname));
            for relay in all {
                println!(
                    "{:<16} {:<22} {} {}",
                    relay.nickname,
                    relay.address,
                    relay.id,
                    if relay.online { "online" } else { "offline" }
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_directory_add_and_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let keys = RelayKeyPair::generate(1024).unwrap();
        let key_path = tmp.path().join("relay.pem");
        let public_path = keys.save_pem(&key_path).unwrap();
        let directory = tmp.path().join("directory.json");

        handle_directory(DirectoryCommands::Add {
            public_key: public_path.clone(),
            address: "127.0.0.1:9001".parse().unwrap(),
            nickname: "alpha".into(),
            file: directory.clone(),
        })
        .unwrap();

        let relays = InMemoryRelayRepository::load_json(&directory).unwrap();
        let relay_id = keys.relay_id().unwrap();
        assert_eq!(relays.find(&relay_id).unwrap().nickname, "alpha");

        let hidden = tmp.path().join("hidden.json");
        handle_hidden(HiddenCommands::Publish {
            public_key: public_path,
            exit: relay_id.to_hex(),
            file: hidden.clone(),
        })
        .unwrap();
        let services = InMemoryHiddenServiceRepository::load_json(&hidden).unwrap();
        let address = HiddenAddress::from_public_key(&keys.public_key_der().unwrap());
        assert_eq!(services.find(&address).unwrap().exit, relay_id);
    }
}
