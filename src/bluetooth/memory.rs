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

//! In-process radio backend.
//!
//! A [`MemoryAir`] is a shared medium; every [`MemoryRadio`] created on it
//! can discover the others and open RFCOMM-style sockets to their
//! listeners. Sockets are [`tokio::io::duplex`] pipes, so dropping one end
//! is seen by the other as end-of-stream.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::device::{Address, Device};
use super::radio::{BoxedSocket, Radio, RadioEvent, RfcommListener, RfcommSocket};

const PIPE_CAPACITY: usize = 64 * 1024;
const EVENT_CAPACITY: usize = 64;

type Incoming = mpsc::UnboundedSender<(BoxedSocket, Device)>;

#[derive(Default)]
struct AirInner {
    /// Radios currently visible to discovery.
    visible: HashMap<Address, String>,
    listeners: HashMap<(Address, Uuid), Incoming>,
    /// Radios whose listeners never answer a connect.
    stalled: HashSet<Address>,
}

/// Shared medium connecting in-memory radios.
#[derive(Clone, Default)]
pub struct MemoryAir {
    inner: Arc<Mutex<AirInner>>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a powered, discoverable radio on this medium.
    pub fn radio(&self, address: Address, name: impl Into<String>) -> MemoryRadio {
        let name = name.into();
        self.inner.lock().visible.insert(address, name.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        MemoryRadio {
            device: Device::new(address, name),
            air: self.clone(),
            state: Arc::new(Mutex::new(RadioState {
                enabled: true,
                ..Default::default()
            })),
            events,
        }
    }

    /// Make connects to `address` hang until cancelled.
    pub fn stall(&self, address: Address) {
        self.inner.lock().stalled.insert(address);
    }

    fn set_visible(&self, device: &Device, visible: bool) {
        let mut inner = self.inner.lock();
        if visible {
            inner.visible.insert(device.address, device.name.clone());
        } else {
            inner.visible.remove(&device.address);
        }
    }

    fn visible_except(&self, address: Address) -> Vec<Device> {
        let inner = self.inner.lock();
        let mut devices: Vec<Device> = inner
            .visible
            .iter()
            .filter(|(addr, _)| **addr != address)
            .map(|(addr, name)| Device::new(*addr, name.clone()))
            .collect();
        devices.sort_by_key(|d| d.address);
        devices
    }
}

#[derive(Debug, Default)]
struct RadioState {
    enabled: bool,
    discovering: bool,
    bonded: Vec<Device>,
    enable_requests: usize,
    discovery_starts: usize,
    discovery_cancels: usize,
}

/// An in-memory [`Radio`].
#[derive(Clone)]
pub struct MemoryRadio {
    device: Device,
    air: MemoryAir,
    state: Arc<Mutex<RadioState>>,
    events: broadcast::Sender<RadioEvent>,
}

impl MemoryRadio {
    /// This radio as seen by its peers.
    pub fn device(&self) -> Device {
        self.device.clone()
    }

    pub fn set_bonded(&self, devices: Vec<Device>) {
        self.state.lock().bonded = devices;
    }

    /// Power the radio on or off, notifying subscribers.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.state.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if !enabled {
                state.discovering = false;
            }
        }
        self.air.set_visible(&self.device, enabled);
        self.emit(RadioEvent::RadioStateChanged { enabled });
    }

    /// Deliver an arbitrary event to subscribers.
    pub fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    /// End a running discovery as if its time box expired.
    pub fn finish_discovery(&self) {
        let was_discovering = std::mem::replace(&mut self.state.lock().discovering, false);
        if was_discovering {
            self.emit(RadioEvent::DiscoveryFinished);
        }
    }

    /// Stop answering connects, as a hung peer would.
    pub fn stall(&self) {
        self.air.stall(self.device.address);
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovering
    }

    pub fn enable_requests(&self) -> usize {
        self.state.lock().enable_requests
    }

    pub fn discovery_starts(&self) -> usize {
        self.state.lock().discovery_starts
    }

    pub fn discovery_cancels(&self) -> usize {
        self.state.lock().discovery_cancels
    }

    /// Tear down the listener for `uuid`, as a radio reset would.
    ///
    /// A pending accept on it fails with `ConnectionAborted`.
    pub fn drop_listener(&self, uuid: Uuid) {
        self.air
            .inner
            .lock()
            .listeners
            .remove(&(self.device.address, uuid));
    }

    /// Whether a listener is registered for `uuid` on this radio.
    pub fn is_listening(&self, uuid: Uuid) -> bool {
        self.air
            .inner
            .lock()
            .listeners
            .contains_key(&(self.device.address, uuid))
    }
}

#[async_trait]
impl Radio for MemoryRadio {
    fn local_name(&self) -> Option<String> {
        Some(self.device.name.clone())
    }

    async fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    async fn request_enable(&self) {
        self.state.lock().enable_requests += 1;
    }

    async fn bonded_devices(&self) -> io::Result<Vec<Device>> {
        Ok(self.state.lock().bonded.clone())
    }

    async fn start_discovery(&self) -> io::Result<()> {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "radio is off"));
            }
            state.discovery_starts += 1;
            if state.discovering {
                return Ok(());
            }
            state.discovering = true;
        }

        self.emit(RadioEvent::DiscoveryStarted);
        for device in self.air.visible_except(self.device.address) {
            self.emit(RadioEvent::DeviceFound(device));
        }
        Ok(())
    }

    async fn cancel_discovery(&self) -> io::Result<()> {
        self.state.lock().discovery_cancels += 1;
        self.finish_discovery();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Box<dyn RfcommListener>> {
        let key = (self.device.address, uuid);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut inner = self.air.inner.lock();
            if inner.listeners.contains_key(&key) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "service already registered",
                ));
            }
            inner.listeners.insert(key, tx);
        }

        debug!("Memory listener '{}' registered on {}", service_name, self.device.address);
        Ok(Box::new(MemoryListener {
            key,
            air: self.air.clone(),
            incoming: rx,
        }))
    }

    async fn create_socket(&self, device: &Device, uuid: Uuid) -> io::Result<BoxedSocket> {
        Ok(Box::new(MemorySocket {
            stream: None,
            target: Some(Target {
                air: self.air.clone(),
                local: self.device.clone(),
                remote: device.address,
                uuid,
            }),
        }))
    }
}

struct MemoryListener {
    key: (Address, Uuid),
    air: MemoryAir,
    incoming: mpsc::UnboundedReceiver<(BoxedSocket, Device)>,
}

#[async_trait]
impl RfcommListener for MemoryListener {
    async fn accept(&mut self) -> io::Result<(BoxedSocket, Device)> {
        self.incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.air.inner.lock().listeners.remove(&self.key);
    }
}

struct Target {
    air: MemoryAir,
    local: Device,
    remote: Address,
    uuid: Uuid,
}

/// One end of an in-memory RFCOMM link.
pub struct MemorySocket {
    stream: Option<DuplexStream>,
    target: Option<Target>,
}

impl MemorySocket {
    /// A socket that was never connected and has nowhere to connect to.
    pub fn unconnected() -> Self {
        Self {
            stream: None,
            target: None,
        }
    }

    /// A connected pair of sockets.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        (Self::connected(a), Self::connected(b))
    }

    fn connected(stream: DuplexStream) -> Self {
        Self {
            stream: Some(stream),
            target: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut DuplexStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))
    }
}

#[async_trait]
impl RfcommSocket for MemorySocket {
    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = self.target.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "socket has no remote service")
        })?;

        let (stalled, listener) = {
            let inner = target.air.inner.lock();
            (
                inner.stalled.contains(&target.remote),
                inner.listeners.get(&(target.remote, target.uuid)).cloned(),
            )
        };

        if stalled {
            debug!("Connect to {} stalled", target.remote);
            return std::future::pending().await;
        }

        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "read failed, socket might closed or timeout, read ret: -1",
            )
        };
        let listener = listener.ok_or_else(refused)?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let server_side: BoxedSocket = Box::new(MemorySocket::connected(remote));
        listener
            .send((server_side, target.local.clone()))
            .map_err(|_| refused())?;

        self.stream = Some(local);
        self.target = None;
        Ok(())
    }
}

impl AsyncRead for MemorySocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for MemorySocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
