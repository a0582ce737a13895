mod orchestrator;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};

use scope_core::InstrumentKind;
use scope_link::{Connection, ScopeConfig, SimOptions, SimServer};

#[derive(Parser)]
#[command(name = "scope", about = "Microscope session orchestrator and MCP server")]
struct Cli {
    /// Config file (defaults to $SCOPE_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Run the synthetic instrument peer
    Simulate {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9092")]
        listen: String,

        /// Native sampling pitch
        #[arg(long, default_value_t = 0.1)]
        pitch: f64,

        /// Scan area spans [-E, E] on both axes
        #[arg(long, default_value_t = 5.0)]
        half_extent: f64,

        /// Extra delay before answering acquisitions, in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
    },

    /// Connect to a peer, open a dataset and print what it reports
    Probe {
        /// Peer address (defaults to the configured address for --kind)
        #[arg(long)]
        address: Option<String>,

        /// Dataset reference
        #[arg(long)]
        dataset: String,

        /// Instrument kind: STEM or AFM
        #[arg(long)]
        kind: String,
    },
}

fn load_config(cli: &Cli) -> Result<ScopeConfig> {
    ScopeConfig::load(cli.config.as_deref()).context("failed to load configuration")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Simulate {
            listen,
            pitch,
            half_extent,
            latency_ms,
        } => cmd_simulate(listen, *pitch, *half_extent, *latency_ms).await,
        Commands::Probe {
            address,
            dataset,
            kind,
        } => cmd_probe(&cli, address.as_deref(), dataset, kind).await,
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    tracing::info!(
        stem = %config.peers.stem,
        afm = %config.peers.afm,
        "starting MCP server"
    );

    let server = server::ScopeServer::new(config);
    let service = server
        .serve(stdio())
        .await
        .context("failed to start MCP server")?;
    service.waiting().await?;
    Ok(())
}

async fn cmd_simulate(
    listen: &str,
    pitch: f64,
    half_extent: f64,
    latency_ms: Option<u64>,
) -> Result<()> {
    let options = SimOptions {
        pitch,
        half_extent,
        latency: latency_ms.map(Duration::from_millis),
        ..SimOptions::default()
    };
    let sim = SimServer::bind(listen, options)
        .await
        .with_context(|| format!("failed to start simulator on {listen}"))?;
    eprintln!("Simulator listening on {}", sim.local_addr()?);
    sim.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await
    .context("simulator failed")
}

async fn cmd_probe(cli: &Cli, address: Option<&str>, dataset: &str, kind: &str) -> Result<()> {
    let config = load_config(cli)?;
    let kind = InstrumentKind::parse(kind)
        .with_context(|| format!("unsupported instrument kind '{kind}', expected STEM or AFM"))?;
    let address = address.unwrap_or_else(|| config.address_for(kind));

    let mut conn = Connection::connect(address, config.timeout())
        .await
        .with_context(|| format!("failed to reach {address}"))?;
    let handle = conn
        .initialize(kind, dataset)
        .await
        .with_context(|| format!("failed to open dataset '{dataset}'"))?;

    let g = handle.geometry;
    let report = serde_json::json!({
        "address": conn.address(),
        "instrument_kind": handle.kind,
        "dataset": handle.dataset,
        "pitch": g.pitch,
        "extent": g.extent,
        "columns": g.columns(),
        "rows": g.rows(),
        "channels": handle.channels,
        "info": handle.info,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
