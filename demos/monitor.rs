//! Curing monitor example
//!
//! Demonstrates a complete sensor session:
//! - Scanning for the ConCure sensor with the service filter on
//! - Connecting to the strongest matching peripheral
//! - Printing temperature, humidity and battery frames as they arrive
//! - Sending a command string to the sensor
//!
//! Run with: cargo run --example monitor
//!
//! To connect to a specific sensor:
//!   cargo run --example monitor -- --address AA:BB:CC:DD:EE:FF

use concure_ble::platform::{drive, BtleplugTransport, DEFAULT_TICK};
use concure_ble::{
    BleSession, ConnectionState, Error, EventKind, GrantAll, Result, SessionConfig, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,concure_ble=debug".into()),
        )
        .init();

    println!("ConCure Curing Monitor");
    println!("======================\n");

    let args: Vec<String> = std::env::args().collect();
    let target_address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let (transport, transport_events) = BtleplugTransport::new().await?;
    let session = Arc::new(BleSession::new(
        SessionConfig::default(),
        GrantAll,
        transport,
    )?);

    session.subscribe(EventKind::DeviceFound, |event| {
        if let SessionEvent::DeviceFound(peripheral) = event {
            println!(
                "Found: {} ({}) {} dBm",
                peripheral.display_name(),
                peripheral.address,
                peripheral.last_seen_signal_strength
            );
        }
    });

    session.subscribe(EventKind::Connected, |event| {
        if let SessionEvent::Connected(peripheral) = event {
            println!("\nConnected to {}\n", peripheral.display_name());
        }
    });

    session.subscribe(EventKind::ConnectionFailed, |event| {
        if let SessionEvent::ConnectionFailed { address, reason } = event {
            eprintln!("Connection to {} failed: {}", address, reason);
        }
    });

    session.subscribe(EventKind::Disconnected, |event| {
        if let SessionEvent::Disconnected { address, reason } = event {
            println!("Disconnected from {} ({:?})", address, reason);
        }
    });

    session.subscribe(EventKind::WriteFailed, |event| {
        if let SessionEvent::WriteFailed {
            partial_chunks_written,
            reason,
        } = event
        {
            eprintln!(
                "Send failed after {} chunk(s): {}",
                partial_chunks_written, reason
            );
        }
    });

    session.subscribe(EventKind::DataReceived, |event| {
        if let SessionEvent::DataReceived { frame, received_at, .. } = event {
            println!("[{}] {}", received_at.format("%H:%M:%S"), frame);
        }
    });

    let driver = tokio::spawn(drive(session.clone(), transport_events, DEFAULT_TICK));

    println!("Scanning for sensors...\n");
    session.start_scan(true)?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    session.stop_scan();

    // Platform ids differ in case and shape (MAC, BlueZ path, UUID).
    let sensor = match target_address {
        Some(address) => session
            .discovered_peripherals()
            .into_iter()
            .find(|p| p.address.eq_ignore_ascii_case(&address)),
        None => session.discovered_peripherals().into_iter().next(),
    }
    .ok_or_else(|| Error::ConnectionFailed {
        reason: "no sensor found".to_string(),
    })?;

    println!("Connecting to {}...", sensor.display_name());
    session.connect(sensor)?;

    // Wait for the link to come up
    for _ in 0..30 {
        if session.state() != ConnectionState::Connecting
            && session.state() != ConnectionState::ServiceDiscovery
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if session.state() == ConnectionState::Ready {
        session.send(b"STATUS")?;

        println!("Monitoring for 60 seconds (Ctrl+C to stop)...\n");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            _ = tokio::signal::ctrl_c() => println!("\nInterrupted"),
        }

        let readings = session.latest_readings();
        println!("\n=== Latest Readings ===");
        if let Some(temperature) = readings.temperature {
            println!("Temperature: {:.1}°C", temperature);
        }
        if let Some(humidity) = readings.humidity {
            println!("Humidity:    {:.1}%", humidity);
        }
        if let Some(battery) = readings.battery {
            println!("Battery:     {}%", battery);
        }
    }

    session.cleanup();
    driver.abort();

    println!("Done!");
    Ok(())
}
