//! HaLink - Coordination-Store Link for Replicated Redis
//!
//! Runs the liveness-key cron loop for one node and offers a few operator
//! commands against the coordination store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use halink::config::HaLinkConfig;
use halink::coordination::{CoordinationSession, Connector, EtcdConnector, TlsMaterial};
use halink::cron::{HaLink, LinkSettings};
use halink::error::{Error, Result};
use halink::node::NodeContext;
use halink::role::PrimaryRecord;

/// HaLink - Coordination-Store Link for Replicated Redis
#[derive(Parser)]
#[command(name = "halink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "halink.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cron loop until interrupted
    Run,

    /// Print the current liveness key
    Status,

    /// Remove every key under the deployment's namespace prefix
    Purge {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "halink.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "redis-0")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let logging = match cli.command {
        Commands::Init { .. } => None,
        _ => HaLinkConfig::from_file(&cli.config).ok().map(|c| c.logging),
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = logging
        .map(|l| l.format)
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format);

    match cli.command {
        Commands::Run => run_cron(&cli.config).await,
        Commands::Status => run_status(&cli.config).await,
        Commands::Purge { yes } => run_purge(&cli.config, yes).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn connector(config: &HaLinkConfig) -> EtcdConnector {
    EtcdConnector::new(config.connect_timeout(), config.request_timeout())
}

/// Open a one-off session for operator commands
async fn open_session(config: &HaLinkConfig) -> Result<Box<dyn CoordinationSession>> {
    let address = config
        .coordination
        .address
        .as_deref()
        .ok_or_else(|| Error::Config("coordination.address is not set".into()))?;

    let connector = connector(config);
    match &config.coordination.tls {
        None => connector.connect_plain(address).await,
        Some(tls) => {
            let material = TlsMaterial::load(tls).await?;
            connector.connect_tls(address, &material).await
        }
    }
}

/// Run the cron loop
async fn run_cron(config_path: &Path) -> Result<()> {
    let config = HaLinkConfig::from_file(config_path)?;
    let node = NodeContext::from_config(&config);

    tracing::info!("Starting HaLink");
    tracing::info!("Node ID: {}", node.id);
    tracing::info!("Role: {}", node.role());
    match &config.coordination.address {
        Some(address) => tracing::info!("Coordination store: [{}]", address),
        None => tracing::info!("No coordination address configured, link disabled"),
    }

    let mut link = HaLink::new(
        Arc::new(connector(&config)),
        LinkSettings::from_config(&config),
    );

    let mut interval = tokio::time::interval(config.cron_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = link.cron_step(&node).await;
                tracing::trace!("Tick: {:?}", outcome);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    link.shutdown(&node).await;
    Ok(())
}

/// Print the current liveness key
async fn run_status(config_path: &Path) -> Result<()> {
    let config = HaLinkConfig::from_file(config_path)?;
    let key = config.liveness_key();
    let mut session = open_session(&config).await?;

    let result = session.get(&key).await;
    session.close().await?;

    match result? {
        Some(entry) => {
            let record = PrimaryRecord::decode(&entry.value_str());
            println!("Liveness key:   {}", key);
            println!("Primary:        {}", record.node_id);
            println!("Address:        {}", record.address);
            if let Some(since) = record.since {
                println!("Since:          {}", since.to_rfc3339());
            }
            println!("Revision:       {}", entry.mod_revision);
        }
        None => {
            println!("Liveness key {} is absent: no live primary", key);
        }
    }
    Ok(())
}

/// Remove every key under the namespace prefix
async fn run_purge(config_path: &Path, yes: bool) -> Result<()> {
    let config = HaLinkConfig::from_file(config_path)?;
    let prefix = config.namespace_prefix();

    if !yes {
        eprintln!("Refusing to remove keys under {} without --yes", prefix);
        return Err(Error::Config("purge requires --yes".into()));
    }

    let mut session = open_session(&config).await?;
    let result = session.remove_subtree(&prefix).await;
    session.close().await?;

    let deleted = result?;
    tracing::info!("Removed {} keys under {}", deleted, prefix);
    println!("Removed {} keys under {}", deleted, prefix);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# HaLink Configuration
# Generated configuration file

[node]
id = "{node_id}"
advertise_address = "127.0.0.1:6379"
# Set on replicas; a node without upstream is the primary
# upstream = "10.0.0.5:6379"

[coordination]
# Comma-separated etcd endpoints (ETCD_ADDR overrides)
address = "127.0.0.1:2379"
connect_timeout_ms = 500
request_timeout_ms = 500

# [coordination.tls]
# ca_file = "/usr/bin/etcd-ca.crt"
# cert_file = "/usr/bin/etcd-client.crt"
# key_file = "/usr/bin/etcd-key.crt"

[ha]
namespace = "sys-redis"
resource = "redis-test"
key_ttl_secs = 10
cron_interval_ms = 1000
reclaim_grace_secs = 20
resign_on_shutdown = true
# previous_key = "/sys-redis-ha-default-redis-old"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the node and coordination store.");
    println!("Then start with: halink --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match HaLinkConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Liveness Key: {}", config.liveness_key());
            println!(
                "  Coordination: {}",
                config.coordination.address.as_deref().unwrap_or("(disabled)")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: &Path) -> Result<()> {
    let config = HaLinkConfig::from_file(config_path)?;
    let node = NodeContext::from_config(&config);

    println!("HaLink Node Information");
    println!("=======================");
    println!();
    println!("Node ID:          {}", node.id);
    println!("Advertise:        {}", node.advertise_address);
    println!("Role:             {}", node.role());
    println!("Upstream:         {}", node.upstream().unwrap_or("(none)"));
    println!();
    println!("Coordination Store:");
    println!(
        "  Address:        {}",
        config.coordination.address.as_deref().unwrap_or("(disabled)")
    );
    println!("  TLS:            {}", config.coordination.tls.is_some());
    println!("  Connect:        {} ms", config.coordination.connect_timeout_ms);
    println!("  Request:        {} ms", config.coordination.request_timeout_ms);
    println!();
    println!("Liveness Key:");
    println!("  Key:            {}", config.liveness_key());
    println!("  TTL:            {} s", config.ha.key_ttl_secs);
    println!("  Cron Interval:  {} ms", config.ha.cron_interval_ms);
    if let Some(previous) = &config.ha.previous_key {
        println!("  Reclaim:        {} after {} s", previous, config.ha.reclaim_grace_secs);
    }

    Ok(())
}
