//! keepnet - Decentralized storage network node

use anyhow::Result;
use clap::{Parser, Subcommand};
use keepnet_core::PeerId;
use keepnet_dht::RoutingOptions;
use keepnet_node::config::{expand_path, parse_peer_addr};
use keepnet_node::{start_client, start_node, Config, Node, Role};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "keepnet")]
#[command(about = "Decentralized storage network node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.keepnet/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Extra peer to dial, as <peer id>@<host:port> (repeatable)
    #[arg(short, long)]
    peer: Vec<String>,

    /// Listen address for one-shot commands
    #[arg(long, default_value = "127.0.0.1:0")]
    client_listen: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and identity
    Init {
        /// Role this node plays
        #[arg(short, long, value_enum, default_value = "user")]
        role: Role,
    },

    /// Run the node until interrupted
    Run {
        /// Key to announce this node as a provider of (repeatable)
        #[arg(long)]
        provide: Vec<String>,
    },

    /// Store a value in the DHT
    Put {
        #[arg(required = true)]
        key: String,
        #[arg(required = true)]
        value: String,

        /// Acknowledgements required
        #[arg(short, long)]
        quorum: Option<usize>,
    },

    /// Fetch a value from the DHT
    Get {
        #[arg(required = true)]
        key: String,
    },

    /// List providers of a key
    Providers {
        #[arg(required = true)]
        key: String,

        /// Maximum number of providers (0 for all)
        #[arg(short, long, default_value = "20")]
        count: usize,
    },

    /// Look up a peer's addresses
    FindPeer {
        /// Peer id (hex-encoded)
        #[arg(required = true)]
        id: String,
    },

    /// Send a MetaInfo message to a peer
    Meta {
        /// Target peer id (hex-encoded)
        #[arg(required = true)]
        peer: String,
        /// Operation, e.g. putTo, getFrom, appendTo, listFrom, deleteFrom
        #[arg(required = true)]
        caller: String,
        #[arg(required = true)]
        key: String,
        #[arg(default_value = "")]
        value: String,

        /// Do not wait for a reply
        #[arg(long)]
        oneway: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);

    match cli.command {
        Commands::Init { role } => {
            init_config(&config_path, role)?;
        }
        Commands::Run { provide } => {
            let mut config = load_config(&config_path, &cli.peer)?;
            config.provide.extend(provide);
            run_node(&config).await?;
        }
        command => {
            let config = load_config(&config_path, &cli.peer)?;
            let node = start_client(&config, &cli.client_listen).await?;
            let result = run_command(&node, command).await;
            node.shutdown().await;
            result?;
        }
    }

    Ok(())
}

fn load_config(path: &Path, extra_peers: &[String]) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        tracing::warn!("No config at {}, using defaults", path.display());
        Config::default()
    };
    for peer in extra_peers {
        parse_peer_addr(peer)?;
        config.bootstrap_peers.push(peer.clone());
    }
    Ok(config)
}

fn init_config(path: &Path, role: Role) -> Result<()> {
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }

    let config = Config {
        role,
        ..Default::default()
    };
    config.save(path)?;

    let id = keepnet_node::node::load_or_create_identity(&config.data_dir())?;

    println!("Initialized keepnet at: {}", path.display());
    println!("Role: {}", role);
    println!("Peer ID: {}", id);

    Ok(())
}

async fn run_node(config: &Config) -> Result<()> {
    let node = start_node(config).await?;
    if let Err(e) = node.dht.bootstrap() {
        tracing::warn!("Bootstrap disabled: {}", e);
    }

    println!("Node is running as {}", config.role);
    println!("Address: {}", node.dial_string());
    println!();
    println!("Press Ctrl+C to stop.");

    // Provider records expire, so announcements are repeated well within their validity
    let mut reprovide = tokio::time::interval(node.dht.config().providers.provide_validity / 2);
    loop {
        tokio::select! {
            _ = reprovide.tick(), if !config.provide.is_empty() => {
                node.announce(&config.provide).await;
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }
    tracing::info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

async fn run_command(node: &Node, command: Commands) -> Result<()> {
    let dht = &node.dht;

    match command {
        Commands::Put { key, value, quorum } => {
            let opts = RoutingOptions {
                quorum,
                ..Default::default()
            };
            dht.put_value(&key, value.into_bytes(), opts).await?;
            println!("Stored: {}", key);
        }
        Commands::Get { key } => {
            let value = dht.get_value(&key, RoutingOptions::default()).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Providers { key, count } => {
            let mut rx = dht.find_providers_async(key.as_bytes(), count);
            let mut providers = Vec::new();
            while let Some(info) = rx.recv().await {
                providers.push(info);
            }
            println!("{}", serde_json::to_string_pretty(&providers)?);
        }
        Commands::FindPeer { id } => {
            let id: PeerId = id.parse()?;
            let info = dht.find_peer(&id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Meta {
            peer,
            caller,
            key,
            value,
            oneway,
        } => {
            let peer: PeerId = peer.parse()?;
            if oneway {
                dht.send_meta_message(&key, value.into_bytes(), &peer, &caller).await?;
                println!("Sent");
            } else {
                let reply = dht.send_meta_request(&key, value.into_bytes(), &peer, &caller).await?;
                println!("{}", reply);
            }
        }
        Commands::Init { .. } | Commands::Run { .. } => anyhow::bail!("not a one-shot command"),
    }

    Ok(())
}
