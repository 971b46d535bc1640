// src/main.rs
//! Lua State Pool runner
//!
//! Runs a Lua script a number of times through the worker pool and prints
//! every completion plus the final monitor counters as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use lua_state_pool::observability::{init_metrics, init_tracing, publish};
use lua_state_pool::runtime::{Chunk, LuaInterpreter, Monitor, WorkerGroup};
use lua_state_pool::utils::config::{Settings, DEFAULT_LOCATION};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lua-state-pool")]
#[command(about = "Run Lua scripts through a pool of reusable interpreter states")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Location whose pool runs the script
    #[arg(short, long, default_value = DEFAULT_LOCATION)]
    location: String,

    /// Number of times to run the script
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Lua script returning an integer
    script: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::read(cli.config.as_deref()).context("failed to load settings")?;
    init_tracing(settings.log_format)?;
    settings.validate().context("invalid settings")?;
    if let Some(addr) = &settings.metrics_addr {
        init_metrics(addr)?;
    }

    info!("Starting Lua State Pool v{}", lua_state_pool::VERSION);

    let monitor = settings.monitor.then(|| Arc::new(Monitor::new()));
    let group = WorkerGroup::start::<LuaInterpreter>(&settings, monitor)?;

    let chunk = Chunk::from_file(&cli.script)
        .with_context(|| format!("failed to read {}", cli.script.display()))?;

    let mut completions = Vec::with_capacity(cli.count);
    for _ in 0..cli.count {
        let completion = group.submit(&cli.location, chunk.clone()).await?;
        if completion.failure.is_some() {
            warn!(
                "Run on worker {} failed with code {}",
                completion.worker, completion.code
            );
        }
        completions.push(completion);
    }

    let snapshot = group.monitor().map(|monitor| monitor.snapshot());
    if let Some(snapshot) = &snapshot {
        publish(snapshot);
    }
    let stats = group.stats().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "completions": completions,
            "pools": stats,
            "monitor": snapshot,
        }))?
    );

    group.shutdown();
    Ok(())
}
