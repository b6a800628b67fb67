// Copyright 2026 Daniel Pelikan
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

//! RFCOMM chat - command line front end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rfcomm_chat::bluetooth::{Address, AllowAll, BluezRadio, Device};
use rfcomm_chat::{BluetoothController, Config, ConnectionEvent, ConnectionEvents};

#[derive(Parser)]
#[command(name = "rfcomm-chat", version, about = "Chat with a peer over Bluetooth RFCOMM")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for one peer to connect, then chat
    Listen,
    /// Connect to a peer, then chat
    Connect {
        /// Peer address, e.g. 00:11:22:33:44:55
        address: Address,
    },
    /// Scan for nearby devices
    Scan {
        /// How long to scan, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// List paired devices
    Paired,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("rfcomm_chat=info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("Starting rfcomm-chat v{}...", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    let device_name = config.bluetooth.device_name();
    let radio = BluezRadio::new(Some(&device_name))
        .await
        .context("opening Bluetooth adapter")?;
    let controller =
        BluetoothController::new(Arc::new(radio), Arc::new(AllowAll), config.session_settings())
            .await;

    let result = match cli.command {
        Command::Listen => {
            info!("Waiting for a peer as '{}'", device_name);
            let events = controller.start_server().await?;
            chat(&controller, events).await
        }
        Command::Connect { address } => {
            let peer = controller
                .registry()
                .paired()
                .into_iter()
                .find(|d| d.address == address)
                .unwrap_or_else(|| Device::new(address, ""));
            let events = controller.connect_to_device(&peer)?;
            chat(&controller, events).await
        }
        Command::Scan { seconds } => scan(&controller, Duration::from_secs(seconds)).await,
        Command::Paired => {
            for device in controller.registry().paired() {
                println!("{}  {}", device.address, device.display_name());
            }
            Ok(())
        }
    };

    controller.release();
    result
}

async fn scan(controller: &BluetoothController, duration: Duration) -> Result<()> {
    let mut scanned = controller.scanned_devices();
    let mut printed = 0;
    controller.start_discovery().await;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = scanned.changed() => {
                if changed.is_err() {
                    break;
                }
                let devices = scanned.borrow_and_update().clone();
                for device in devices.iter().skip(printed) {
                    println!("{}  {}", device.address, device.display_name());
                }
                printed = devices.len();
            }
        }
    }

    controller.stop_discovery().await;
    Ok(())
}

async fn chat(controller: &BluetoothController, mut events: ConnectionEvents) -> Result<()> {
    println!("{}", controller.connection_state().borrow().as_str());
    let peer = tokio::select! {
        event = events.recv() => match event {
            Some(ConnectionEvent::Established { device }) => device,
            Some(ConnectionEvent::Error(message)) => bail!("connection failed: {}", message),
            None => bail!("connection attempt cancelled"),
        },
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };
    println!("Connected to {}. Type a message and press enter.", peer);

    let mut log = controller.subscribe_messages()?;
    tokio::spawn(async move {
        while let Some(snapshot) = log.next().await {
            if let Some(message) = snapshot.last().filter(|m| !m.is_local) {
                println!("{}: {}", message.sender, message.body);
            }
        }
    });

    let mut connected = controller.connected();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let logged = controller.messages().len();
                    match controller.try_send_message(&line).await {
                        None => warn!("Connect permission missing, message not sent"),
                        Some(_) if controller.messages().len() == logged => {
                            warn!("Message not delivered");
                        }
                        Some(_) => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = connected.wait_for(|c| !*c) => {
                println!("Disconnected from {}", peer);
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.close_connection();
    Ok(())
}
