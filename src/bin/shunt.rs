use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use shunt::config::File;
use shunt::{dns, metrics, relay};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// SNI-aware TCP relay with a DNS front-end that steers clients toward
/// it.
///
/// Answers DNS queries for the configured domains with the relay's own
/// address, then forwards the redirected connections to their real
/// destination based on the peeked server name.
#[derive(Parser, Debug)]
#[command(name = "shunt")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short = 'c', long)]
    config_path: PathBuf,

    /// Verbose (debug-level) output.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(args).await {
        Ok(clean) if clean => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Starts all configured services and waits for a termination signal.
/// Returns whether shutdown was clean.
async fn run(args: Args) -> Result<bool> {
    let file = File::load(&args.config_path)
        .with_context(|| format!("failed to load config from {:?}", args.config_path))?;

    let relay_config = file.to_relay_config()?;
    let dns_config = file.to_dns_config()?;
    let prometheus_addr = file.prometheus_addr()?;

    if let Some(addr) = prometheus_addr {
        metrics::set_up_gauge();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(addr).await {
                error!("metrics: endpoint failed: {}", err);
            }
        });
    }

    let dns_server = dns_config.map(dns::Server::new);
    if let Some(server) = &dns_server {
        server.start().await.context("failed to start DNS server")?;
    }

    let relay_server = relay::Server::new(relay_config);
    relay_server
        .start()
        .await
        .context("failed to start relay server")?;

    wait_for_signal().await?;

    info!("shutting down services");
    let mut clean = true;

    if let Err(err) = relay_server.close().await {
        error!("failed to close relay server: {}", err);
        clean = false;
    }
    if let Some(server) = &dns_server
        && let Err(err) = server.close().await
    {
        error!("failed to close DNS server: {}", err);
        clean = false;
    }

    Ok(clean)
}

/// Blocks until SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
