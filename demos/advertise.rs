//! Commissionable advertisement example
//!
//! Demonstrates the peripheral role:
//! - Announcing the device with commissioning service data
//! - Receiving data written by a commissioner
//!
//! The peripheral role needs BlueZ, so build with the `bluez` feature on Linux:
//!
//! Run with: cargo run --example advertise --features bluez
//!
//! To advertise for a custom duration (in seconds):
//!   cargo run --example advertise --features bluez -- --seconds 120

use ble_role_provisioner::{
    Broadcaster, ProvisionerConfig, Result, RoleProvisioner, TransportInterface,
};
use std::time::Duration;

/// Discriminator and vendor/product bytes announced as service data.
const ADVERTISEMENT: [u8; 8] = [0x00, 0x00, 0x0F, 0xF1, 0xFF, 0x00, 0x80, 0x00];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_role_provisioner=debug")
        .init();

    println!("Commissionable Advertisement");
    println!("============================\n");

    let args: Vec<String> = std::env::args().collect();
    let seconds = args
        .iter()
        .position(|arg| arg == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60);

    let config = ProvisionerConfig::default().with_local_name("ble-provisioner-demo");
    let provisioner = RoleProvisioner::new(config)?;

    let broadcaster = provisioner.broadcaster(None).await?;
    broadcaster.announce(&ADVERTISEMENT).await?;
    println!("Advertising for {} seconds...\n", seconds);

    // Same peripheral session as the broadcaster.
    let transport = provisioner.transport_interface().await?;
    let _handle = transport.on_data(|data| {
        println!("Received {} bytes from {}: {:02X?}", data.data.len(), data.address, &data.data[..]);
    });

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    broadcaster.stop().await?;
    provisioner.shutdown().await?;
    println!("\nDone.");

    Ok(())
}
