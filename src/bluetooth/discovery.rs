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

//! Device discovery.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::radio::{Capability, PermissionCheck, Radio, RadioEvent};
use super::registry::DeviceRegistry;
use crate::error::{ChatError, Result};
use crate::state::StateCell;

/// Starts and stops scanning and folds discovery events into the registry.
///
/// The scanning flag follows the radio's own started/finished events, so
/// it lags behind [`stop`](DiscoveryCoordinator::stop) until the radio
/// confirms.
pub struct DiscoveryCoordinator {
    radio: Arc<dyn Radio>,
    permissions: Arc<dyn PermissionCheck>,
    registry: Arc<DeviceRegistry>,
    scanning: Arc<StateCell<bool>>,
    pump: Mutex<Option<CancellationToken>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        radio: Arc<dyn Radio>,
        permissions: Arc<dyn PermissionCheck>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            radio,
            permissions,
            registry,
            scanning: Arc::new(StateCell::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Subscribe to radio events. Must be called inside a tokio runtime.
    pub fn attach(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let events = self.radio.subscribe();
        tokio::spawn(Self::event_loop(
            events,
            self.registry.clone(),
            self.scanning.clone(),
            cancel.clone(),
        ));
        *pump = Some(cancel);
        debug!("Discovery event pump attached");
    }

    /// Unsubscribe from radio events.
    pub fn detach(&self) {
        if let Some(cancel) = self.pump.lock().take() {
            cancel.cancel();
            debug!("Discovery event pump detached");
        }
    }

    async fn event_loop(
        mut events: broadcast::Receiver<RadioEvent>,
        registry: Arc<DeviceRegistry>,
        scanning: Arc<StateCell<bool>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(RadioEvent::DeviceFound(device)) => {
                    registry.record_scanned(device);
                }
                Ok(RadioEvent::DiscoveryStarted) => {
                    info!("Discovery started");
                    scanning.set_if_changed(true);
                }
                Ok(RadioEvent::DiscoveryFinished) => {
                    info!("Discovery finished");
                    scanning.set_if_changed(false);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Discovery pump lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Refresh paired devices and start scanning.
    pub async fn start(&self) -> Result<()> {
        self.check_radio().await?;

        self.registry
            .refresh_paired(self.radio.as_ref(), self.permissions.as_ref())
            .await;

        self.radio.start_discovery().await.map_err(|e| {
            warn!("Failed to start discovery: {}", e);
            ChatError::Radio(e.to_string())
        })?;
        info!("Discovery requested");
        Ok(())
    }

    /// Cancel scanning.
    pub async fn stop(&self) -> Result<()> {
        self.check_radio().await?;

        self.radio.cancel_discovery().await.map_err(|e| {
            warn!("Failed to cancel discovery: {}", e);
            ChatError::Radio(e.to_string())
        })?;
        debug!("Discovery cancel requested");
        Ok(())
    }

    /// Scan permission and powered radio. A powered-off radio triggers an
    /// enable request.
    async fn check_radio(&self) -> Result<()> {
        if !self.permissions.has_capability(Capability::Scan) {
            debug!("Scan permission missing");
            return Err(ChatError::PermissionDenied(Capability::Scan));
        }
        if !self.radio.is_enabled().await {
            info!("Bluetooth is off, requesting enable");
            self.radio.request_enable().await;
            return Err(ChatError::RadioDisabled);
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.get()
    }

    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanning.subscribe()
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}
