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

//! BlueZ radio backed by `bluer`.
//!
//! RFCOMM sockets are obtained through registered profiles, so BlueZ
//! publishes the SDP record and resolves the channel for both roles.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role, Stream};
use bluer::{AdapterEvent, AdapterProperty, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::device::{Address, Device};
use super::radio::{BoxedSocket, Radio, RadioEvent, RfcommListener, RfcommSocket};

const EVENT_CAPACITY: usize = 64;

fn io_err(err: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

fn to_bluer(address: Address) -> bluer::Address {
    bluer::Address::new(address.0)
}

fn from_bluer(address: bluer::Address) -> Address {
    Address::new(address.0)
}

async fn describe(adapter: &bluer::Adapter, address: bluer::Address) -> Device {
    let name = match adapter.device(address) {
        Ok(device) => device.alias().await.unwrap_or_default(),
        Err(_) => String::new(),
    };
    Device::new(from_bluer(address), name)
}

/// The running discovery task, if any.
///
/// Each run gets a generation number so a task that ends on its own only
/// clears its own entry, never one started after it was cancelled.
#[derive(Clone, Default)]
struct DiscoverySlot {
    inner: Arc<Mutex<SlotInner>>,
}

#[derive(Default)]
struct SlotInner {
    generation: u64,
    running: Option<(u64, CancellationToken)>,
}

impl DiscoverySlot {
    /// Claim the slot for a new run. `None` while a run is active.
    fn begin(&self) -> Option<(u64, CancellationToken)> {
        let mut inner = self.inner.lock();
        if inner.running.is_some() {
            return None;
        }
        inner.generation += 1;
        let run = (inner.generation, CancellationToken::new());
        inner.running = Some(run.clone());
        Some(run)
    }

    /// Clear the slot if it still belongs to run `generation`.
    fn finish(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if matches!(inner.running, Some((g, _)) if g == generation) {
            inner.running = None;
        }
    }

    /// Cancel the active run and free the slot.
    fn cancel(&self) {
        if let Some((_, cancel)) = self.inner.lock().running.take() {
            cancel.cancel();
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.inner.lock().running.is_some()
    }
}

/// The default BlueZ adapter.
pub struct BluezRadio {
    session: Session,
    adapter: bluer::Adapter,
    name: Option<String>,
    events: broadcast::Sender<RadioEvent>,
    discovery: DiscoverySlot,
    watcher: CancellationToken,
}

impl BluezRadio {
    /// Open the default adapter and start watching it.
    ///
    /// The adapter alias is set to `device_name` when given.
    pub async fn new(device_name: Option<&str>) -> bluer::Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if let Some(name) = device_name {
            adapter.set_alias(name.to_string()).await?;
            info!("Bluetooth name set to: {}", name);
        }
        adapter.set_pairable(true).await?;
        let name = adapter.alias().await.ok();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watcher = CancellationToken::new();
        tokio::spawn(Self::watch_adapter(
            adapter.clone(),
            events.clone(),
            watcher.clone(),
        ));

        Ok(Self {
            session,
            adapter,
            name,
            events,
            discovery: DiscoverySlot::default(),
            watcher,
        })
    }

    /// Forward power changes and start a link watcher per known device.
    async fn watch_adapter(
        adapter: bluer::Adapter,
        events: broadcast::Sender<RadioEvent>,
        cancel: CancellationToken,
    ) {
        match adapter.device_addresses().await {
            Ok(addresses) => {
                for address in addresses {
                    Self::spawn_link_watch(&adapter, address, &events, &cancel);
                }
            }
            Err(e) => warn!("Failed to enumerate devices: {}", e),
        }

        let mut stream = match adapter.events().await {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                error!("Failed to watch adapter: {}", e);
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(enabled))) => {
                    info!("Adapter powered: {}", enabled);
                    let _ = events.send(RadioEvent::RadioStateChanged { enabled });
                }
                Some(AdapterEvent::DeviceAdded(address)) => {
                    Self::spawn_link_watch(&adapter, address, &events, &cancel);
                }
                Some(_) => {}
                None => break,
            }
        }
        debug!("Adapter watcher stopped");
    }

    fn spawn_link_watch(
        adapter: &bluer::Adapter,
        address: bluer::Address,
        events: &broadcast::Sender<RadioEvent>,
        cancel: &CancellationToken,
    ) {
        let Ok(device) = adapter.device(address) else {
            return;
        };
        let events = events.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = match device.events().await {
                Ok(stream) => Box::pin(stream),
                Err(e) => {
                    debug!("No events for {}: {}", address, e);
                    return;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => event,
                };
                match event {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected))) => {
                        let name = device.alias().await.unwrap_or_default();
                        let peer = Device::new(from_bluer(address), name);
                        let _ = events.send(if connected {
                            RadioEvent::AclConnected(peer)
                        } else {
                            RadioEvent::AclDisconnected(peer)
                        });
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        });
    }

    async fn discover(
        adapter: bluer::Adapter,
        events: broadcast::Sender<RadioEvent>,
        slot: DiscoverySlot,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let mut found = match adapter.discover_devices().await {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                error!("Failed to start discovery: {}", e);
                slot.finish(generation);
                return;
            }
        };
        let _ = events.send(RadioEvent::DiscoveryStarted);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = found.next() => event,
            };
            match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    let device = describe(&adapter, address).await;
                    let _ = events.send(RadioEvent::DeviceFound(device));
                }
                Some(_) => {}
                None => break,
            }
        }

        // dropping the stream ends discovery on the adapter
        drop(found);
        slot.finish(generation);
        let _ = events.send(RadioEvent::DiscoveryFinished);
    }

    async fn register(&self, uuid: Uuid, name: Option<String>, role: Role) -> io::Result<ProfileHandle> {
        let profile = Profile {
            uuid,
            name,
            role: Some(role),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        self.session.register_profile(profile).await.map_err(io_err)
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        self.watcher.cancel();
        self.discovery.cancel();
    }
}

#[async_trait]
impl Radio for BluezRadio {
    fn local_name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    async fn request_enable(&self) {
        info!("Powering on Bluetooth adapter...");
        if let Err(e) = self.adapter.set_powered(true).await {
            warn!("Failed to power on adapter: {}", e);
        }
    }

    async fn bonded_devices(&self) -> io::Result<Vec<Device>> {
        let mut devices = Vec::new();
        for address in self.adapter.device_addresses().await.map_err(io_err)? {
            let device = self.adapter.device(address).map_err(io_err)?;
            if device.is_paired().await.map_err(io_err)? {
                let name = device.alias().await.unwrap_or_else(|_| address.to_string());
                devices.push(Device::new(from_bluer(address), name));
            }
        }
        Ok(devices)
    }

    async fn start_discovery(&self) -> io::Result<()> {
        let Some((generation, cancel)) = self.discovery.begin() else {
            debug!("Discovery already running");
            return Ok(());
        };

        tokio::spawn(Self::discover(
            self.adapter.clone(),
            self.events.clone(),
            self.discovery.clone(),
            generation,
            cancel,
        ));
        Ok(())
    }

    async fn cancel_discovery(&self) -> io::Result<()> {
        self.discovery.cancel();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Box<dyn RfcommListener>> {
        let handle = self
            .register(uuid, Some(service_name.to_string()), Role::Server)
            .await?;
        Ok(Box::new(BluezListener {
            handle,
            adapter: self.adapter.clone(),
        }))
    }

    async fn create_socket(&self, device: &Device, uuid: Uuid) -> io::Result<BoxedSocket> {
        let handle = self.register(uuid, None, Role::Client).await?;
        let target = self.adapter.device(to_bluer(device.address)).map_err(io_err)?;
        Ok(Box::new(BluezSocket {
            target: Some((target, uuid)),
            profile: Some(handle),
            stream: None,
        }))
    }
}

/// Server profile registration. Dropping it unregisters the profile.
struct BluezListener {
    handle: ProfileHandle,
    adapter: bluer::Adapter,
}

#[async_trait]
impl RfcommListener for BluezListener {
    async fn accept(&mut self) -> io::Result<(BoxedSocket, Device)> {
        let request = self.handle.next().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered")
        })?;

        let address = request.device();
        let stream = request.accept().map_err(io_err)?;
        let device = describe(&self.adapter, address).await;
        Ok((
            Box::new(BluezSocket {
                target: None,
                profile: None,
                stream: Some(stream),
            }),
            device,
        ))
    }
}

/// RFCOMM stream, or a client profile waiting to connect.
struct BluezSocket {
    target: Option<(bluer::Device, Uuid)>,
    profile: Option<ProfileHandle>,
    stream: Option<Stream>,
}

#[async_trait]
impl RfcommSocket for BluezSocket {
    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let (Some((device, uuid)), Some(profile)) = (self.target.as_ref(), self.profile.as_mut())
        else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket has no target"));
        };
        let address = device.address();

        let request = {
            let connect = async {
                if !device.is_connected().await.unwrap_or(false) {
                    device.connect().await?;
                }
                device.connect_profile(uuid).await
            };
            tokio::pin!(connect);
            let mut connect_done = false;

            loop {
                tokio::select! {
                    result = &mut connect, if !connect_done => {
                        result.map_err(io_err)?;
                        connect_done = true;
                    }
                    request = profile.next() => {
                        let request = request.ok_or_else(|| {
                            io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered")
                        })?;
                        if request.device() == address {
                            break request;
                        }
                        debug!("Rejecting profile connection from {}", request.device());
                        request.reject(ReqError::Rejected);
                    }
                }
            }
        };

        self.stream = Some(request.accept().map_err(io_err)?);
        Ok(())
    }
}

impl AsyncRead for BluezSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl AsyncWrite for BluezSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_rejects_second_run() {
        let slot = DiscoverySlot::default();
        assert!(slot.begin().is_some());
        assert!(slot.begin().is_none());
    }

    #[test]
    fn test_finished_run_frees_slot() {
        let slot = DiscoverySlot::default();
        let (generation, cancel) = slot.begin().unwrap();

        slot.finish(generation);
        assert!(!slot.is_running());
        assert!(!cancel.is_cancelled());
        assert!(slot.begin().is_some());
    }

    #[test]
    fn test_stale_finish_keeps_newer_run() {
        let slot = DiscoverySlot::default();
        let (first, first_cancel) = slot.begin().unwrap();
        slot.cancel();
        assert!(first_cancel.is_cancelled());

        let (second, second_cancel) = slot.begin().unwrap();
        assert_ne!(first, second);

        // the cancelled task exits after the new run started
        slot.finish(first);
        assert!(slot.is_running());
        assert!(!second_cancel.is_cancelled());
    }
}
