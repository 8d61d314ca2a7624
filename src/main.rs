//! IngeLight demonstration
//!
//! Scans for nearby peripherals and prints what was found. Given a device id,
//! connects to it, discovers its services and reads every readable
//! characteristic.
//!
//! Usage: `ingelight [device-id]`. Settings come from `ingelight.toml` in the
//! working directory and `INGELIGHT_*` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use ingelight::ble::{self, DeviceRecord, SessionManager};
use ingelight::config::SessionConfig;
use tracing::{error, info, warn};

const SCAN_DURATION: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SessionConfig::load(Some(Path::new("ingelight.toml")))?;
    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("🚀 Starting IngeLight session demo");

    let radio = ble::create_radio_adapter()
        .await
        .context("no usable Bluetooth adapter")?;
    let manager = SessionManager::new(radio, config);

    let mut state = manager.adapter_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_ready()))
        .await
        .context("adapter did not power on")??;

    manager.start_scanning(None).await?;
    info!("🔍 Scanning for {:?}", SCAN_DURATION);
    tokio::time::sleep(SCAN_DURATION).await;
    manager.stop_scanning().await;

    let records: Vec<DeviceRecord> = manager
        .discovered_devices()
        .current()
        .iter()
        .map(|device| device.record())
        .collect();
    info!("Found {} devices", records.len());
    println!("{}", serde_json::to_string_pretty(&records)?);

    let Some(target) = std::env::args().nth(1) else {
        return Ok(());
    };

    let device = manager.connect(&target).await?;
    info!("✅ Connected to {}", device.id());

    for service in device.discover_services().await? {
        let characteristics = match service.discover_characteristics().await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!("Skipping service {}: {}", service.uuid(), e);
                continue;
            }
        };
        for characteristic in characteristics
            .iter()
            .filter(|c| c.properties().can_read())
        {
            match characteristic.read().await {
                Ok(value) => info!("{} = {:02x?}", characteristic.uuid(), value),
                Err(e) => error!("❌ Read of {} failed: {}", characteristic.uuid(), e),
            }
        }
        println!("{}", serde_json::to_string_pretty(&service.record())?);
    }

    manager.disconnect(&target).await?;
    info!("📊 {:?}", manager.stats());
    Ok(())
}
