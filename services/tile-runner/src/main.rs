//! Tile graph runner.
//!
//! Loads a run file (graph + synthetic sources), resolves it, computes the
//! target bands tile by tile and logs per-band and session statistics.

mod config;
mod runner;
mod sources;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tile_engine::EngineConfig;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::RunFile;
use runner::Runner;

#[derive(Parser, Debug)]
#[command(name = "tile-runner")]
#[command(about = "Compute a tile graph over synthetic sources")]
struct Args {
    /// Run file (YAML or JSON)
    #[arg(short, long, env = "TILE_GRAPH", default_value = "graphs/speckle_median.yaml")]
    graph: PathBuf,

    /// Node to compute (default: the run file's target)
    #[arg(short, long)]
    target: Option<String>,

    /// Override TILE_WIDTH and TILE_HEIGHT with a square tile size
    #[arg(long)]
    tile_size: Option<usize>,

    /// Override MAX_CONCURRENT_TILES
    #[arg(long)]
    max_concurrent_tiles: Option<usize>,

    /// Write the run summary as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);
    if args.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let mut config = EngineConfig::from_env();
    if let Some(size) = args.tile_size {
        config.tile_width = size;
        config.tile_height = size;
    }
    if let Some(count) = args.max_concurrent_tiles {
        config.max_concurrent_tiles = count;
    }

    let run = RunFile::load(&args.graph)?;
    info!(
        graph = %args.graph.display(),
        nodes = run.graph.nodes.len(),
        sources = run.sources.len(),
        "Loaded run file"
    );

    let runner = Runner::new(&run, args.target.as_deref(), config)?;

    // Ctrl-C cancels the session; tiles already computed stay cached.
    let token = runner.scheduler().cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling tile computations");
            token.cancel();
        }
    });

    let summary = runner.run().await?;
    info!(
        target_node = %summary.target,
        bands = summary.bands.len(),
        kernel_invocations = summary.stats.kernel_invocations,
        elapsed_ms = summary.elapsed_ms as u64,
        "Run complete"
    );

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary: {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
    }

    Ok(())
}
