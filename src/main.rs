// Copyright 2026 Vidyut Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Vidyut Link console frontend.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidyut_link::bluetooth::{BluetoothManager, DeviceInfo};
use vidyut_link::config::Config;
use vidyut_link::events::EventProcessor;
use vidyut_link::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidyut_link=info".parse().unwrap()),
        )
        .init();

    info!("Starting Vidyut Link v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Create application state
    let state = AppState::new();

    // Initialize the connection manager
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(32);
    let manager = Arc::new(
        BluetoothManager::new(
            config.bluetooth.device_name.clone(),
            config.bluetooth.rfcomm_channel,
            event_tx,
        )
        .await?,
    );

    let (notice_tx, mut notice_rx) = tokio::sync::mpsc::channel::<String>(32);
    let processor = Arc::new(EventProcessor::new(
        manager.clone(),
        state.clone(),
        notice_tx,
    ));

    // Route manager events into the shared state
    let processor_events = processor.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            processor_events.process_event(event).await;
        }
    });

    // Surface transient failures
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            println!("! {notice}");
        }
    });

    println!("Commands: scan, devices, connect <n>, on, off, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("scan") => {
                if processor.scan_devices().await {
                    println!("Scanning; run `devices` to see the list");
                }
            }
            Some("devices") => {
                print_devices(&manager.devices());
            }
            Some("connect") => {
                let devices = manager.devices();
                match parts.next().and_then(|arg| arg.parse::<usize>().ok()) {
                    Some(index) if index < devices.len() => {
                        processor.connect(&devices[index]).await;
                    }
                    _ => println!("Usage: connect <n>  (see `devices`)"),
                }
            }
            Some("on") => processor.turn_led_on().await,
            Some("off") => processor.turn_led_off().await,
            Some("status") => {
                let status = state.get_status();
                match state.get_device_name() {
                    Some(name) => println!("{} ({})", status.as_str(), name),
                    None => println!("{}", status.as_str()),
                }
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command: {other}"),
            None => {}
        }
    }

    manager.clear().await;
    info!("Vidyut Link stopped");
    Ok(())
}

fn print_devices(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("No devices yet; run `scan` first");
        return;
    }
    for (index, device) in devices.iter().enumerate() {
        println!("{index}: {} [{}]", device.label(), device.address);
    }
}
