//! Dstore Controller
//!
//! Coordinates a cluster of Dstore storage nodes over a text-line TCP
//! protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dstore_controller::api::HttpServer;
use dstore_controller::config::ControllerConfig;
use dstore_controller::controller::Controller;
use dstore_controller::error::Result;
use dstore_controller::network::ControllerServer;
use dstore_controller::replication::ReplicationConfig;

/// Dstore Controller - coordinator for a replicated file-storage cluster
#[derive(Parser)]
#[command(name = "dstore-controller")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "controller.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller
    Start(StartArgs),

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "controller.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show controller configuration
    Info,
}

/// Values that override the configuration file
#[derive(Args)]
struct StartArgs {
    /// Port for clients and Dstores
    #[arg(short, long)]
    port: Option<u16>,

    /// Replicas required per file
    #[arg(short = 'r', long)]
    replication_factor: Option<usize>,

    /// Acknowledgement timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Rebalance period in milliseconds
    #[arg(long)]
    rebalance_period_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(cli.config, cli.log_level, args).await,
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
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

/// Load the configuration file, falling back to defaults when it is absent
fn load_config(config_path: &Path) -> Result<ControllerConfig> {
    if config_path.exists() {
        ControllerConfig::from_file(config_path)
    } else {
        Ok(ControllerConfig::default())
    }
}

/// Start the controller
async fn run_start(config_path: PathBuf, log_level: Option<String>, args: StartArgs) -> Result<()> {
    let mut config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    if let Some(port) = args.port {
        config.controller.port = port;
    }
    if let Some(r) = args.replication_factor {
        config.controller.replication_factor = r;
    }
    if let Some(timeout) = args.timeout_ms {
        config.controller.timeout_ms = timeout;
    }
    if let Some(period) = args.rebalance_period_ms {
        config.controller.rebalance_period_ms = period;
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format);
    tracing::info!("Starting Dstore controller...");
    if !config_path.exists() {
        tracing::info!("No configuration file at {:?}, using defaults", config_path);
    }
    tracing::info!(
        "Replication factor {}, timeout {} ms, rebalance every {} ms",
        config.controller.replication_factor,
        config.controller.timeout_ms,
        config.controller.rebalance_period_ms
    );

    let controller = Controller::new(ReplicationConfig::from(&config));
    let rebalancer_handle = controller.rebalancer().spawn();

    let http_server_handle = if config.api.enabled {
        let http_server = HttpServer::new(config.api.clone(), Arc::clone(&controller));
        Some(tokio::spawn(async move {
            if let Err(e) = http_server.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    let server = ControllerServer::new(
        Arc::clone(&controller),
        config.bind_address(),
        config.controller.max_line_length,
    );
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!("Controller server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    // Cleanup
    rebalancer_handle.abort();
    if let Some(handle) = http_server_handle {
        handle.abort();
    }

    tracing::info!("Dstore controller shutdown complete");
    Ok(())
}

/// Write a default configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let content = format!(
        "# Dstore Controller Configuration\n# Generated configuration file\n\n{}",
        ControllerConfig::default().to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: dstore-controller --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ControllerConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Port: {}", config.controller.port);
            println!("  Replication Factor: {}", config.controller.replication_factor);
            println!("  Timeout: {} ms", config.controller.timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show controller configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;

    println!("Dstore Controller Configuration");
    println!("===============================");
    println!();
    println!("Listen Address:     {}", config.bind_address());
    println!("Replication Factor: {}", config.controller.replication_factor);
    println!("Timeout:            {} ms", config.controller.timeout_ms);
    println!("Rebalance Period:   {} ms", config.controller.rebalance_period_ms);
    println!("Max Line Length:    {} bytes", config.controller.max_line_length);
    println!();
    println!("HTTP API:");
    println!("  Enabled:          {}", config.api.enabled);
    println!("  Bind Address:     {}", config.api.bind_address);
    println!();
    println!("Logging:            {} ({})", config.logging.level, config.logging.format);

    Ok(())
}
