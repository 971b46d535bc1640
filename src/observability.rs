// src/observability.rs
//! Logging and metrics export
//!
//! Logs go through `tracing` with an `EnvFilter` (`RUST_LOG`, default
//! `info`), as plain text or JSON lines. Monitor counters are exported as
//! Prometheus gauges when a listener address is configured.

use crate::runtime::monitor::MonitorSnapshot;
use crate::utils::config::LogFormat;
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const STATES_GAUGE: &str = "lua_pool_states";
pub const MEMORY_GAUGE: &str = "lua_pool_memory_bytes";
pub const REQUESTS_GAUGE: &str = "lua_pool_requests";

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Plain => registry.with(fmt::layer()).try_init(),
    }
    .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Serve Prometheus metrics on `addr`. Must run inside a tokio runtime.
pub fn init_metrics(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address: {}", addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    metrics::describe_gauge!(STATES_GAUGE, "Live interpreter states across all workers");
    metrics::describe_gauge!(
        MEMORY_GAUGE,
        metrics::Unit::Bytes,
        "Memory last reported by live states"
    );
    metrics::describe_gauge!(REQUESTS_GAUGE, "Units of work completed");

    tracing::info!("Metrics listening on {}", addr);
    Ok(())
}

/// Publish a monitor snapshot to the installed recorder
pub fn publish(snapshot: &MonitorSnapshot) {
    metrics::gauge!(STATES_GAUGE).set(snapshot.states as f64);
    metrics::gauge!(MEMORY_GAUGE).set(snapshot.memory_used as f64);
    metrics::gauge!(REQUESTS_GAUGE).set(snapshot.requests as f64);
}
