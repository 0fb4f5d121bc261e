use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use tokio::time::{sleep, timeout};

use crate::config::Config;

pub type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// The slice of the BLE peripheral the desk driver needs. Kept narrow so
/// the driver can run against a fake link in tests.
#[async_trait]
pub trait DeskLink: Send + Sync + 'static {
    fn characteristics(&self) -> Vec<Characteristic>;

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, btleplug::Error>;

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), btleplug::Error>;

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error>;

    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error>;

    async fn notifications(&self) -> Result<NotificationStream, btleplug::Error>;

    async fn disconnect(&self) -> Result<(), btleplug::Error> {
        Ok(())
    }
}

#[async_trait]
impl DeskLink for Peripheral {
    fn characteristics(&self) -> Vec<Characteristic> {
        btleplug::api::Peripheral::characteristics(self)
            .into_iter()
            .collect()
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, btleplug::Error> {
        btleplug::api::Peripheral::read(self, characteristic).await
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), btleplug::Error> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        btleplug::api::Peripheral::write(self, characteristic, data, write_type).await
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::subscribe(self, characteristic).await
    }

    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::unsubscribe(self, characteristic).await
    }

    async fn notifications(&self) -> Result<NotificationStream, btleplug::Error> {
        btleplug::api::Peripheral::notifications(self).await
    }

    async fn disconnect(&self) -> Result<(), btleplug::Error> {
        btleplug::api::Peripheral::disconnect(self).await
    }
}

/// Scan for the configured desk and return it once discovered. The scan
/// polls in one-second slices up to `scan_timeout` seconds.
async fn discover(adapter: &Adapter, mac_address: &str, scan_timeout: u64) -> Result<Peripheral> {
    log::info!("Scanning for desk {}...", mac_address);
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start BLE scan")?;

    let mut found = None;
    for _ in 0..scan_timeout.max(1) {
        sleep(Duration::from_secs(1)).await;

        for peripheral in adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties
                    .address
                    .to_string()
                    .eq_ignore_ascii_case(mac_address)
                {
                    found = Some(peripheral);
                    break;
                }
            }
        }
        if found.is_some() {
            break;
        }
    }

    adapter.stop_scan().await?;
    found.ok_or_else(|| anyhow!("Desk with address {} not found", mac_address))
}

/// Pick the adapter matching the configured name, or the first one.
async fn select_adapter(manager: &Manager, adapter_name: &str) -> Result<Adapter> {
    let adapters = manager.adapters().await?;

    for candidate in &adapters {
        if let Ok(info) = candidate.adapter_info().await {
            if info.starts_with(adapter_name) {
                return Ok(candidate.clone());
            }
        }
    }

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapters found"))
}

/// Connect to the desk, with retries, and discover its services.
pub async fn connect(config: &Config) -> Result<(Adapter, Peripheral)> {
    let mac_address = config.mac_address.as_str();

    let manager = Manager::new().await?;
    let adapter = select_adapter(&manager, &config.adapter_name).await?;

    let peripheral = discover(&adapter, mac_address, config.scan_timeout).await?;

    // Let the BLE stack settle after scanning before opening a connection.
    sleep(Duration::from_millis(1000)).await;

    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        if attempt > 1 {
            log::info!("Connection retry attempt {} of {}", attempt, max_retries);
            sleep(Duration::from_secs(2)).await;
        }

        match connect_to_peripheral(&peripheral, config.connection_timeout).await {
            Ok(()) => {
                log::info!("Connected to {}", mac_address);
                return Ok((adapter, peripheral));
            }
            Err(e) => {
                log::warn!("Connection attempt {} failed: {}", attempt, e);
                if let Ok(true) = peripheral.is_connected().await {
                    let _ = btleplug::api::Peripheral::disconnect(&peripheral).await;
                    sleep(Duration::from_millis(500)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow!("Failed to connect to desk after {} attempts", max_retries)))
}

async fn connect_to_peripheral(peripheral: &Peripheral, connection_timeout: u64) -> Result<()> {
    let is_connected = timeout(Duration::from_secs(5), peripheral.is_connected())
        .await
        .context("Timeout checking connection status")?
        .context("Failed to check connection status")?;

    if !is_connected {
        timeout(
            Duration::from_secs(connection_timeout),
            peripheral.connect(),
        )
        .await
        .with_context(|| format!("Timeout connecting to desk ({}s)", connection_timeout))?
        .context("Failed to connect to desk")?;
    }

    timeout(Duration::from_secs(10), peripheral.discover_services())
        .await
        .context("Timeout discovering services (10s)")?
        .context("Failed to discover services")?;

    let count = btleplug::api::Peripheral::characteristics(peripheral).len();
    if count == 0 {
        return Err(anyhow!("Desk exposed no characteristics"));
    }
    log::debug!("Discovered {} characteristics", count);

    Ok(())
}

/// Watch adapter events and terminate the process when the desk drops the
/// link. The desk may be mid-move in an unknown state; restarting is safer
/// than resuming. A disconnect after the shutdown signal is the expected
/// teardown and is not treated as a failure.
pub fn spawn_disconnect_watcher(
    adapter: Adapter,
    id: PeripheralId,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                log::error!("Failed to watch adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(disconnected) = event {
                if disconnected != id {
                    continue;
                }
                if *shutdown.borrow() {
                    log::debug!("Desk disconnected during shutdown");
                    break;
                }
                log::error!("Lost connection with desk, exiting");
                std::process::exit(1);
            }
        }
    });
}
