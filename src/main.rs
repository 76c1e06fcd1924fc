mod config;
mod conversion;
mod forwarder;
mod metrics;
mod models;
mod mqtt_service;
mod publisher;
mod rest_server;
mod service_utils;
mod topics;

use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::mqtt_service::{BrokerManager, ConnectOptions, RumqttConnector};
use crate::rest_server::{run_rest_server, AppState};
use crate::service_utils::handle_shutdown;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            // logging is not set up yet, the verbose flag lives in the config
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    info!(
        "Configuration: mqtt tcp://{}:{} client '{}' entry point '{}', proxy {} {}{}, http {}",
        config.mqtt_host,
        config.mqtt_port,
        config.mqtt_client_id,
        config.entry_point,
        if config.proxy_enabled { "enabled" } else { "disabled" },
        config.proxy_url,
        config.proxy_path,
        config.http_addr,
    );

    let forwarder = if config.proxy_enabled {
        match Forwarder::new(&config.proxy_url, config.proxy_timeout()) {
            Ok(forwarder) => Some(forwarder),
            Err(e) => {
                error!("{}", e);
                return;
            }
        }
    } else {
        None
    };

    let broker = BrokerManager::new(
        Arc::new(RumqttConnector),
        ConnectOptions::from_config(&config),
    );

    // Connect eagerly so a misconfigured broker shows up in the log right away.
    if let Err(e) = broker.ensure_connected().await {
        warn!("Broker not reachable at startup, will retry on the next report: {}", e);
    }

    let state = AppState::new(config.clone(), broker.clone(), forwarder);
    let shutdown = handle_shutdown(broker, config);

    if let Err(e) = run_rest_server(state, shutdown).await {
        error!("HTTP server failed: {}", e);
        std::process::exit(1);
    }
    info!("Bridge shut down.");
}
