mod api;
mod config;
mod debounce;
mod desk;
mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use btleplug::api::Peripheral as _;
use tokio::sync::{watch, RwLock};

use config::{Config, SharedConfig};
use desk::bluetooth::DeskLink;
use desk::protocol::DeskProtocol;
use desk::units::format_number;
use desk::Desk;
use webhook::HeightWebhook;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    log::info!("Starting desk bridge for {}", config.mac_address);

    let webhook = HeightWebhook::from_config(&config)?.map(Arc::new);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (adapter, peripheral) = desk::bluetooth::connect(&config).await?;
    desk::bluetooth::spawn_disconnect_watcher(adapter, peripheral.id(), shutdown_rx.clone());

    let config: SharedConfig = Arc::new(RwLock::new(config));

    let link: Arc<dyn DeskLink> = Arc::new(peripheral);
    let desk = Arc::new(Desk::new(
        link,
        DeskProtocol::LINAK,
        config.clone(),
        shutdown_rx,
    ));
    desk.initialize().await.context("Desk initialization failed")?;

    let telemetry = desk
        .watch_height_speed()
        .await
        .context("Failed to start telemetry watch")?;
    log::info!(
        "Height: {}mm",
        format_number(telemetry.borrow().height.human())
    );

    if let Some(webhook) = webhook {
        webhook::spawn_height_watcher(webhook, telemetry.clone());
    }

    let state = api::AppState {
        desk: desk.clone(),
        config: config.clone(),
        telemetry,
    };
    let app = api::router(state);

    let (server_address, server_port) = {
        let config = config.read().await;
        (config.server_address.clone(), config.server_port)
    };
    let listener = tokio::net::TcpListener::bind((server_address.as_str(), server_port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", server_address, server_port))?;
    log::info!("REST server listening on {}:{}", server_address, server_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
            // Cancels any in-flight move at its next polling boundary and
            // tears down the telemetry listener.
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Leave the desk stationary and release the link.
    desk.park().await;
    log::info!("Disconnected");

    Ok(())
}
