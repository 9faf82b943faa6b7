//! dsctl - Command line tool for inspecting a Dstore controller
//!
//! Usage:
//!   dsctl status        - Show controller status
//!   dsctl nodes         - List joined Dstores
//!   dsctl files         - List files and their replicas
//!   dsctl file <name>   - Show one file in detail

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Dstore Controller Control Tool
#[derive(Parser)]
#[command(name = "dsctl")]
#[command(about = "Inspect a running Dstore controller", long_about = None)]
struct Cli {
    /// Path to controller config file
    #[arg(short, long, default_value = "controller.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show controller status
    Status,
    /// List joined Dstores
    Nodes,
    /// List files and their replicas
    Files,
    /// Show a single file
    File {
        /// File name
        name: String,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    replication_factor: usize,
    #[serde(default)]
    timeout_ms: u64,
    #[serde(default)]
    rebalance_period_ms: u64,
    #[serde(default)]
    live_nodes: usize,
    #[serde(default)]
    files: usize,
    #[serde(default)]
    complete_files: usize,
    #[serde(default)]
    pending_operations: usize,
    #[serde(default)]
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    #[serde(default)]
    id: u16,
    #[serde(default)]
    address: String,
    #[serde(default)]
    joined_at: String,
    #[serde(default)]
    files: usize,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    replicas: Vec<u16>,
    #[serde(default)]
    blacklist: Vec<u16>,
    #[serde(default)]
    loading_clients: Vec<u64>,
    #[serde(default)]
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8081".to_string()
}

/// Endpoint derived from the controller's config file, if readable
fn endpoint_from_config(path: &PathBuf) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let config: Config = toml::from_str(&content).ok()?;
    let addr = config.api.bind_address;
    // Convert bind address to localhost if it's 0.0.0.0
    Some(match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    })
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .or_else(|| endpoint_from_config(&cli.config))
        .unwrap_or_else(|| format!("http://{}", default_api_bind()));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Nodes => list_nodes(&endpoint).await,
        Commands::Files => list_files(&endpoint).await,
        Commands::File { name } => show_file(&endpoint, name).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn fetch<T: serde::de::DeserializeOwned>(url: &str) -> Result<T, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_default();
        return Err(format!("API error: {} {}", status, message).into());
    }

    Ok(response.json().await?)
}

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let status: StatusResponse = fetch(&format!("{}/status", endpoint)).await?;

    let health = if status.live_nodes >= status.replication_factor {
        "\x1b[32mOK\x1b[0m" // Green
    } else {
        "\x1b[31mNOT ENOUGH DSTORES\x1b[0m" // Red
    };

    println!();
    println!("Dstore Controller Status (dsctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Health:             {}", health);
    println!("Live Dstores:       {} (R = {})", status.live_nodes, status.replication_factor);
    println!("Files:              {} ({} complete)", status.files, status.complete_files);
    println!("Pending Operations: {}", status.pending_operations);
    println!("Timeout:            {} ms", status.timeout_ms);
    println!("Rebalance Period:   {} ms", status.rebalance_period_ms);
    println!("Uptime:             {}", format_duration(std::time::Duration::from_secs(status.uptime_seconds)));
    println!();

    Ok(())
}

async fn list_nodes(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Vec<NodeResponse> = fetch(&format!("{}/nodes", endpoint)).await?;

    println!();
    println!("{:<8} {:<25} {:<8} {:<30}", "PORT", "ADDRESS", "FILES", "JOINED");
    println!("{}", "-".repeat(71));
    for node in &nodes {
        println!("{:<8} {:<25} {:<8} {:<30}", node.id, node.address, node.files, node.joined_at);
    }
    println!();
    println!("Total: {} Dstores", nodes.len());

    Ok(())
}

async fn list_files(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let files: Vec<FileResponse> = fetch(&format!("{}/files", endpoint)).await?;

    println!();
    println!("{:<30} {:>12} {:<18} {:<30}", "NAME", "SIZE", "STATUS", "REPLICAS");
    println!("{}", "-".repeat(92));
    for file in &files {
        // Pad status to fixed width BEFORE adding color codes
        let status_padded = format!("{:<18}", file.status);
        let status_colored = match file.status.as_str() {
            "StoreComplete" => format!("\x1b[32m{}\x1b[0m", status_padded),
            "StoreInProgress" | "RemoveInProgress" => format!("\x1b[33m{}\x1b[0m", status_padded),
            _ => status_padded,
        };
        println!(
            "{:<30} {:>12} {} {:<30}",
            file.name,
            file.size,
            status_colored,
            join_ports(&file.replicas)
        );
    }
    println!();
    println!("Total: {} files", files.len());

    Ok(())
}

async fn show_file(endpoint: &str, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let file: FileResponse = fetch(&format!("{}/files/{}", endpoint, name)).await?;

    println!();
    println!("File:            {}", file.name);
    println!("Size:            {} bytes", file.size);
    println!("Status:          {}", file.status);
    println!("Replicas:        {}", join_ports(&file.replicas));
    println!("Blacklisted:     {}", join_ports(&file.blacklist));
    println!("Loading Clients: {}", file.loading_clients.len());
    println!("Created:         {}", file.created_at);
    println!();

    Ok(())
}

fn join_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

/// Format duration as human-readable string
fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
