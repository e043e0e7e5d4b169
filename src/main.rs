//! dynlb - a dynamic TCP/UDP round-robin load balancer
//!
//! Usage:
//!     dynlb [--config <path>]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use dynlb::config::{load_config, Config};
use dynlb::control::ControlServer;
use dynlb::metrics::MetricsServer;
use dynlb::util::init_logging;
use dynlb::AppState;

/// A dynamic TCP/UDP round-robin load balancer.
#[derive(Parser, Debug)]
#[command(name = "dynlb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file; defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Control: {}", config.control.listen);
        println!(
            "  Listener: {} ({} workers per group)",
            config.listener.bind_ip,
            config.listener.resolved_worker_threads()
        );
        println!(
            "  Timeouts: tcp {}, udp {}, health check every {}",
            humantime::format_duration(config.tcp.timeout),
            humantime::format_duration(config.udp.timeout),
            humantime::format_duration(config.health_check.delay)
        );
        return Ok(());
    }

    info!(
        config_path = %cli.config.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        control = %config.control.listen,
        bind_ip = %config.listener.bind_ip,
        "dynlb starting"
    );

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config))
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let state = AppState::new(&config);
    let mut handles = Vec::new();

    let control = ControlServer::bind(
        config.control.listen,
        state.registry().clone(),
        config.control.timeout,
        state.metrics().clone(),
    )
    .await
    .with_context(|| format!("failed to bind control server on {}", config.control.listen))?;
    handles.push(tokio::spawn(control.run(state.shutdown().subscribe())));

    let metrics_config = &config.global.metrics;
    if metrics_config.enabled {
        let server = MetricsServer::bind(
            metrics_config.address,
            metrics_config.path.clone(),
            state.metrics().clone(),
        )
        .await
        .with_context(|| {
            format!("failed to bind metrics server on {}", metrics_config.address)
        })?;
        handles.push(tokio::spawn(server.run(state.shutdown().subscribe())));
    }

    info!("dynlb is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    state.trigger_shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    info!("dynlb shut down complete");
    Ok(())
}
