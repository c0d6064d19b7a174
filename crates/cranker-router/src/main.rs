use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use cranker_core::config::ConfigLoader;
use cranker_core::ConnectionMonitor;
use cranker_router::config::RouterConfig;
use cranker_router::darklaunch::DarkLaunchManager;
use cranker_router::farm::WebsocketFarm;
use cranker_router::ping::PingScheduler;
use cranker_router::state::RouterState;
use cranker_router::validator::IpValidator;
use cranker_router::{admin, registration, reverse_proxy};

/// Cranker router: accepts connector registrations and proxies inbound HTTP
/// requests over them.
#[derive(Parser, Debug)]
#[command(name = "cranker-router", about = "Cranker reverse-tunnel router")]
struct Cli {
    /// Path to the router's YAML config file.
    #[arg(long, short = 'c')]
    config: String,

    /// Log filter directive, e.g. "info" or "cranker_router=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cranker_core::logging::init(&cli.log_level);

    let loader = ConfigLoader::new(&["cranker-router.yaml"]);
    let config: RouterConfig = loader.load_from_file(&cli.config)?;

    let conn_monitor = Arc::new(ConnectionMonitor::default());
    let dark_launch = Arc::new(DarkLaunchManager::default());
    let farm = WebsocketFarm::new(conn_monitor.clone(), dark_launch.clone());
    farm.set_socket_acquire_time(config.socket_acquire_time);

    let ip_validator = Arc::new(IpValidator::new(config.ip_allow_list.clone()));
    for ip in &config.dark_launch_ips {
        if let Err(e) = dark_launch.add_ip(ip.clone()) {
            tracing::warn!(ip, error = %e, "ignoring invalid seeded dark-launch ip");
        }
    }
    for service in &config.dark_launch_services {
        if let Err(e) = dark_launch.add_service(service.clone()) {
            tracing::warn!(service, error = %e, "ignoring invalid seeded dark-launch service");
        }
    }

    let state = RouterState {
        config: Arc::new(config.clone()),
        farm: farm.clone(),
        conn_monitor,
        dark_launch,
        ip_validator,
        router_socket_plugins: Vec::new(),
        proxy_interceptors: Vec::new(),
    };

    let ping_scheduler = PingScheduler::start(farm.clone(), config.ping_schedule_interval, config.idle_timeout);

    let registration_app = Router::new()
        .route("/register", get(registration::register))
        .route("/register/", get(registration::register))
        .route("/deregister", get(registration::deregister))
        .route("/deregister/", get(registration::deregister))
        .merge(admin::router())
        .with_state(state.clone());

    let webserver_app = Router::new()
        .route("/{*path}", any(reverse_proxy::handle))
        .route("/", any(reverse_proxy::handle))
        .with_state(state.clone());

    let registration_addr: SocketAddr = format!("{}:{}", config.websocket_interface, config.registration_port).parse()?;
    let webserver_addr: SocketAddr = format!("{}:{}", config.webserver_interface, config.http_port).parse()?;

    info!(%registration_addr, %webserver_addr, "starting router");

    let registration_listener = TcpListener::bind(registration_addr).await?;
    let webserver_listener = TcpListener::bind(webserver_addr).await?;

    let registration_server = axum::serve(
        registration_listener,
        registration_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown());

    let webserver_server = axum::serve(webserver_listener, webserver_app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown());

    let shutdown_timeout = config.shutdown_timeout;
    let servers = async {
        let (registration_result, webserver_result) = tokio::join!(registration_server, webserver_server);
        registration_result?;
        webserver_result?;
        Ok::<(), std::io::Error>(())
    };

    match tokio::time::timeout(shutdown_timeout, servers).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "server task ended with an error"),
        Err(_) => tracing::warn!(?shutdown_timeout, "graceful shutdown budget elapsed with requests still draining"),
    }

    ping_scheduler.stop();
    farm.stop();

    info!("router shut down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup()).expect("failed to register SIGHUP handler");
    let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit()).expect("failed to register SIGQUIT handler");

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
