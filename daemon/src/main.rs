//! meridian daemon: entry point for running a P2P node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use meridian_crypto::PeerKeyId;
use meridian_network::{DiscardPayloads, TcpDialer, TcpTransportListener};
use meridian_node::{init_logging, LogFormat, NodeConfig, P2pNode};
use meridian_nullables::NullLedger;
use meridian_types::NetworkId;

#[derive(Parser)]
#[command(name = "meridian", about = "meridian P2P node daemon")]
struct Cli {
    /// Path to a TOML configuration file. File settings are the base;
    /// flags and env vars override them.
    #[arg(long, env = "MERIDIAN_CONFIG")]
    config: Option<PathBuf>,

    /// Network to join: "main", "test" or "dev".
    #[arg(long, env = "MERIDIAN_NETWORK")]
    network: Option<String>,

    /// Port for P2P connections (defaults to the network's port).
    #[arg(long, env = "MERIDIAN_PORT")]
    port: Option<u16>,

    /// Seed addresses (comma-separated: "1.2.3.4:20338,5.6.7.8:20338").
    #[arg(long, env = "MERIDIAN_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Log level filter, e.g. "info" or "debug,meridian_network=trace".
    #[arg(long, env = "MERIDIAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "MERIDIAN_LOG_FORMAT")]
    log_format: Option<String>,

    #[arg(long, env = "MERIDIAN_ENABLE_METRICS")]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the node until SIGINT or SIGTERM.
    Run,
    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    if let Some(name) = &cli.network {
        let network =
            NetworkId::parse(name).with_context(|| format!("unknown network {name:?}"))?;
        if cli.port.is_none() && config.listen_port == config.network.default_port() {
            config.listen_port = network.default_port();
        }
        config.network = network;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if !cli.seeds.is_empty() {
        config.seeds = cli.seeds.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format.clone();
    }
    config.enable_metrics |= cli.metrics;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let format: LogFormat = config.log_format.parse()?;
    init_logging(format, &config.log_level)?;

    tracing::info!(
        difficulty = config.identity_difficulty,
        "generating peer identity"
    );
    let key = PeerKeyId::generate(config.identity_difficulty);

    let listener = TcpTransportListener::bind(&config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    let dialer = TcpDialer::new(config.connection.dial_timeout());

    tracing::info!(
        network = config.network.as_str(),
        port = config.listen_port,
        seeds = config.seeds.len(),
        "starting meridian node"
    );
    let node = P2pNode::new(
        config,
        key,
        Arc::new(NullLedger::new()),
        Arc::new(DiscardPayloads),
        Arc::new(dialer),
    )?;
    node.start(Arc::new(listener))?;

    node.wait_for_signal().await;
    node.stop().await;
    Ok(())
}
