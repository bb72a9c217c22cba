// HF Voice Server - Main Entry Point
// Licensed under AGPL v3

use std::sync::Arc;

use clap::Parser;
use hf_voice_server::config::Config;
use hf_voice_server::coordinator::Coordinator;
use hf_voice_server::module::{ModuleRegistry, PropagationModule};
use hf_voice_server::net::listener::TcpServer;
use tokio::signal;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting HF voice server");

    let settings = config.propagation_settings();
    let coordinator = Arc::new(Coordinator::new(
        settings,
        config.work_dir.clone(),
        config.status_interval,
    )?);
    coordinator.init_work_dir().await;

    let mut modules = ModuleRegistry::new();
    modules.register(Box::new(PropagationModule::new(coordinator.clone())));
    let failed = modules.initialize_all();
    if !failed.is_empty() {
        warn!("Modules failed to initialize: {}", failed.join(", "));
    }
    info!("Coordinator initialized");

    // Optional: HTTP server to expose work directory (conditions.json, routing.json)
    if let Ok(port_str) = std::env::var("HTTP_PORT") {
        match port_str.parse::<u16>() {
            Ok(port) if !config.work_dir.is_empty() => {
                let work_dir = config.work_dir.clone();
                tokio::spawn(async move {
                    let listener =
                        match tokio::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await {
                            Ok(l) => l,
                            Err(e) => {
                                error!("HTTP server failed to bind to port {}: {}", port, e);
                                return;
                            }
                        };
                    info!("HTTP server on port {} serving {}", port, work_dir);
                    let app = axum::Router::new().fallback_service(ServeDir::new(work_dir));
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("HTTP server error: {}", e);
                    }
                });
            }
            Ok(_) => warn!("HTTP_PORT set but --work-dir is empty, not serving status files"),
            Err(e) => error!("Invalid HTTP_PORT '{}': {}", port_str, e),
        }
    }

    // Notifications to users and the periodic update loop
    let _notifier = coordinator.spawn_notifier();
    tokio::spawn(coordinator.clone().run());

    let mut servers: Vec<TcpServer> = Vec::new();

    if config.client_listen.is_empty() {
        warn!("No client listeners specified! Use --client-listen [host:]port");
    }

    for listen_addr in &config.client_listen {
        let addr_str = if listen_addr.contains(':') {
            listen_addr.clone()
        } else {
            format!("0.0.0.0:{}", listen_addr)
        };
        match addr_str.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                match TcpServer::start_with_coordinator(addr, coordinator.clone(), config.motd.clone()).await {
                    Ok(server) => servers.push(server),
                    Err(e) => error!("Failed to start TCP server on {}: {}", addr, e),
                }
            }
            Err(e) => error!("Invalid listen address '{}': {}", addr_str, e),
        }
    }

    info!("Server ready");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    for mut server in servers {
        server.shutdown().await;
    }
    modules.shutdown_all();

    let user_count = coordinator.user_count().await;
    info!("Server stopped. Final user count: {}", user_count);

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
