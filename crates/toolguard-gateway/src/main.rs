//! toolguard: security-inspecting stdio gateway.
//!
//! Speaks framed JSON-RPC with the agent on stdin/stdout and with each
//! configured tool server over its own stdio. Logs go to stderr so they
//! never interleave with protocol frames.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use toolguard_gateway::{CliOverrides, Gateway, GatewayConfig, GatewayStats, OnThreat, Severity};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "~/.toolguard/config.toml";

/// toolguard: security-inspecting stdio gateway
#[derive(Parser, Debug)]
#[command(name = "toolguard", version, about = "Security-inspecting stdio gateway for tool servers")]
struct Cli {
    /// Config file path (default: ~/.toolguard/config.toml, optional)
    #[arg(long)]
    config: Option<String>,

    /// Action on a detected threat for upstreams without an override (log, block)
    #[arg(long)]
    default_on_threat: Option<OnThreat>,

    /// Minimum severity that blocks (none, low, medium, high, critical)
    #[arg(long)]
    severity_threshold: Option<Severity>,

    /// Requests per minute per upstream; 0 disables rate limiting
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Tool server to launch as the `default` upstream
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting toolguard");

    let (config_path, required) = match cli.config {
        Some(ref path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let overrides = CliOverrides {
        on_threat: cli.default_on_threat,
        severity_threshold: cli.severity_threshold,
        rate_limit_per_minute: cli.rate_limit,
        upstream_command: cli.command,
    };
    let config = GatewayConfig::load(&config_path, required, &overrides)
        .context("failed to load config")?;
    if config.upstreams.is_empty() {
        warn!("no upstreams configured; every request will be rejected");
    }

    let stats = Arc::new(GatewayStats::new());
    let gateway = Arc::new(Gateway::from_config(&config, stats).context("failed to build gateway")?);
    if let Err(e) = gateway.start().await {
        gateway.shutdown().await;
        return Err(e).context("failed to start upstreams");
    }
    info!(
        upstreams = config.upstreams.len(),
        on_threat = ?config.default_policy.on_threat,
        threshold = %config.default_policy.severity_threshold,
        "gateway ready"
    );

    let reporter = config.stats_interval.map(|every| {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.flush_stats();
            }
        })
    });

    let served = tokio::select! {
        result = gateway.serve(tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    if let Some(task) = reporter {
        task.abort();
    }
    gateway.shutdown().await;
    gateway.flush_stats();
    info!("toolguard stopped");

    if let Err(ref e) = served {
        error!(error = %e, "client stream failed");
    }
    served.context("gateway stopped with an error")
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
