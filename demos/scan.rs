//! Commissionable device scan example
//!
//! Demonstrates the central role:
//! - Lazily creating the central session through the provisioner
//! - Scanning for devices that advertise the commissioning service
//! - Opening a channel to the first device found
//!
//! Run with: cargo run --example scan
//!
//! To scan for every device instead of commissionable ones only:
//!   cargo run --example scan -- --all

use ble_role_provisioner::{
    NetworkInterface, ProvisionerConfig, Result, RoleProvisioner, ScanRequest, Scanner,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_role_provisioner=debug")
        .init();

    println!("Commissionable Device Scan");
    println!("==========================\n");

    let scan_all = std::env::args().any(|arg| arg == "--all");

    let config = ProvisionerConfig::default().with_scan_timeout(Duration::from_secs(10));
    let provisioner = RoleProvisioner::new(config)?;

    let request = if scan_all {
        ScanRequest::new(provisioner.config().scan_timeout)
    } else {
        ScanRequest::from_config(provisioner.config())
    };

    println!(
        "Scanning for {:?}...\n",
        provisioner.config().scan_timeout
    );

    let scanner = provisioner.scanner().await?;
    let devices = scanner.find_devices(&request).await?;

    if devices.is_empty() {
        println!("No devices found.");
        provisioner.shutdown().await?;
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for device in &devices {
        println!(
            "  {} {:<24} RSSI: {}",
            device.address,
            device.local_name.as_deref().unwrap_or("(unnamed)"),
            device
                .rssi
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_else(|| "N/A".to_string()),
        );
        for (service, data) in &device.service_data {
            println!("      service data {}: {:02X?}", service, data);
        }
    }
    println!();

    if !scan_all {
        // Same central session as the scanner.
        let network = provisioner.network_interface().await?;
        let target = &devices[0].address;

        println!("Connecting to {}...", target);
        match network.open_channel(target).await {
            Ok(channel) => {
                println!("Connected. Closing channel.");
                channel.close().await?;
            }
            Err(e) => println!("Connection failed: {}", e),
        }
    }

    provisioner.shutdown().await?;
    println!("\nDone.");

    Ok(())
}
