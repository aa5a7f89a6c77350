//! weftd - standalone pipeline server.
//!
//! Loads a declarative flow file, compiles it, optionally exports the
//! resolved plan, deploys the runtimes, and runs until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_flow::supervisor::default_registry;
use weft_flow::{FlowConfig, FrontendClient, Supervisor};

/// weft - distributed search pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Flow configuration file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the compiled plan as JSON to this path and keep running
    #[arg(long)]
    export_plan: Option<PathBuf>,

    /// Compile, export, and exit without deploying
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("weft={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting weftd");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Flow file: {}", args.config.display());

    let config = FlowConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let graph = config.graph().context("building service graph")?;
    let flow = graph
        .compile(&config.compile_options())
        .context("compiling topology")?;
    info!(
        flow = %flow.name,
        stages = flow.nodes.len(),
        edges = flow.edges.len(),
        "topology compiled"
    );

    if let Some(path) = &args.export_plan {
        let json = flow.to_json().context("serializing plan")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing plan to {}", path.display()))?;
        info!("Plan exported to {}", path.display());
    }
    if args.check {
        return Ok(());
    }

    let options = config.deploy_options();
    let registry = default_registry(&options.aggregation);
    let supervisor = Supervisor::new(&registry, options.clone());
    let handle = supervisor.deploy(&flow).await.context("deploying flow")?;

    // Bring up the client boundary so the frontend pair edges connect;
    // external callers reach the flow through the same endpoints.
    let _client = FrontendClient::connect(&flow, &options.transport)
        .await
        .context("connecting frontend")?;
    info!(runtimes = handle.len(), "flow running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    handle.shutdown().await.context("shutting down flow")?;
    Ok(())
}
