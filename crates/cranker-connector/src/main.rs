use clap::Parser;
use tokio::signal;
use tracing::info;

use cranker_connector::config::ConnectorConfig;
use cranker_connector::pool::Connector;
use cranker_core::config::ConfigLoader;

/// Cranker connector: dials out to one or more routers and proxies requests
/// through to a local target service.
#[derive(Parser, Debug)]
#[command(name = "cranker-connector", about = "Cranker reverse-tunnel connector")]
struct Cli {
    /// Path to the connector's YAML config file.
    #[arg(long, short = 'c')]
    config: String,

    /// Log filter directive, e.g. "info" or "cranker_connector=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cranker_core::logging::init(&cli.log_level);

    let loader = ConfigLoader::new(&["cranker-connector.yaml"]);
    let config: ConnectorConfig = loader.load_from_file(&cli.config)?;

    info!(
        routers = config.router_uris.len(),
        target = %config.target_uri,
        route = %config.target_service_name,
        "starting connector"
    );

    let connector = Connector::new(&config, Vec::new());
    connector.start();

    wait_for_shutdown().await;

    info!("shutdown signal received, draining in-flight requests");
    if !connector.shut_down().await {
        tracing::warn!("shutdown timeout elapsed with requests still in flight");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .expect("failed to register SIGHUP handler");
    let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit())
        .expect("failed to register SIGQUIT handler");

    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sighup.recv() => info!("received SIGHUP"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C");
}
