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

//! RFCOMM connection lifecycle: server accept, client connect, close.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::device::Device;
use super::discovery::DiscoveryCoordinator;
use super::protocol::{CHUNK_SIZE, SERVICE_NAME, SERVICE_UUID};
use super::radio::{BoxedSocket, Capability, PermissionCheck, Radio, RadioEvent, RfcommListener};
use super::transport::TransportSession;
use crate::error::{ChatError, Result};
use crate::events::{ConnectionEvent, ConnectionEvents};
use crate::state::{ConnectionState, StateCell};

const ERROR_CAPACITY: usize = 16;

/// Tunables for connection attempts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub service_name: String,
    pub service_uuid: Uuid,
    /// No limit when `None`; a hung peer then blocks until closed.
    pub connect_timeout: Option<Duration>,
    pub accept_timeout: Option<Duration>,
    pub chunk_size: usize,
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            connect_timeout: None,
            accept_timeout: None,
            chunk_size: CHUNK_SIZE,
            event_capacity: 32,
        }
    }
}

/// The single connection slot.
enum Session {
    Idle,
    Connecting {
        cancel: CancellationToken,
    },
    Listening {
        cancel: CancellationToken,
    },
    Connected {
        transport: Arc<TransportSession>,
        device: Device,
        cancel: CancellationToken,
    },
}

impl Session {
    fn name(&self) -> &'static str {
        match self {
            Session::Idle => "idle",
            Session::Connecting { .. } => "connecting",
            Session::Listening { .. } => "listening",
            Session::Connected { .. } => "connected",
        }
    }
}

/// State shared with background accept/connect tasks.
struct Shared {
    session: Mutex<Session>,
    released: AtomicBool,
    state: StateCell<ConnectionState>,
    connected: StateCell<bool>,
    last_connected: StateCell<Option<Device>>,
    errors: broadcast::Sender<ChatError>,
}

impl Shared {
    /// Claim the idle slot for a new attempt.
    fn begin(&self, pending: fn(CancellationToken) -> Session) -> Result<CancellationToken> {
        let mut session = self.session.lock();
        if self.released.load(Ordering::Acquire) {
            return Err(ChatError::Released);
        }
        if !matches!(*session, Session::Idle) {
            debug!("Rejecting attempt, slot is {}", session.name());
            return Err(ChatError::Busy);
        }

        let cancel = CancellationToken::new();
        *session = pending(cancel.clone());
        self.state.set(ConnectionState::Connecting);
        Ok(cancel)
    }

    /// Install a connected transport. Returns false if the attempt was
    /// cancelled in the meantime.
    fn establish(
        &self,
        cancel: &CancellationToken,
        transport: Arc<TransportSession>,
        device: &Device,
    ) -> bool {
        let mut session = self.session.lock();
        if cancel.is_cancelled() {
            transport.close();
            return false;
        }

        *session = Session::Connected {
            transport,
            device: device.clone(),
            cancel: cancel.clone(),
        };
        self.state.set(ConnectionState::Connected);
        self.last_connected.set(Some(device.clone()));
        self.connected.set_if_changed(true);
        true
    }

    /// End a failed attempt. Returns false if it was already cancelled.
    fn fail(&self, cancel: &CancellationToken, reason: &str) -> bool {
        let mut session = self.session.lock();
        if cancel.is_cancelled() {
            return false;
        }

        *session = Session::Idle;
        self.state.set(ConnectionState::Failed(reason.to_string()));
        self.connected.set_if_changed(false);
        true
    }

    fn close(&self) {
        let mut session = self.session.lock();
        match std::mem::replace(&mut *session, Session::Idle) {
            Session::Idle => {}
            Session::Connecting { cancel } | Session::Listening { cancel } => {
                cancel.cancel();
                info!("Pending connection attempt cancelled");
            }
            Session::Connected {
                transport,
                device,
                cancel,
            } => {
                transport.close();
                cancel.cancel();
                info!("Connection to {} closed", device);
            }
        }

        self.state.set_if_changed(ConnectionState::Idle);
        self.connected.set_if_changed(false);
    }

    fn publish_error(&self, error: ChatError) {
        // No subscribers is fine.
        let _ = self.errors.send(error);
    }
}

/// Owns the listening handle, the client socket and the active transport.
///
/// At most one of them exists at a time. A second connect or listen while
/// the slot is busy is rejected with [`ChatError::Busy`].
pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    permissions: Arc<dyn PermissionCheck>,
    discovery: Arc<DiscoveryCoordinator>,
    settings: SessionSettings,
    shared: Arc<Shared>,
    pump: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(
        radio: Arc<dyn Radio>,
        permissions: Arc<dyn PermissionCheck>,
        discovery: Arc<DiscoveryCoordinator>,
        settings: SessionSettings,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            radio,
            permissions,
            discovery,
            settings,
            shared: Arc::new(Shared {
                session: Mutex::new(Session::Idle),
                released: AtomicBool::new(false),
                state: StateCell::new(ConnectionState::Idle),
                connected: StateCell::new(false),
                last_connected: StateCell::new(None),
                errors,
            }),
            pump: Mutex::new(None),
        }
    }

    /// Subscribe to link and power events. Must be called inside a tokio
    /// runtime.
    pub fn attach(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        tokio::spawn(Self::event_loop(
            self.radio.subscribe(),
            self.radio.clone(),
            self.shared.clone(),
            cancel.clone(),
        ));
        *pump = Some(cancel);
    }

    async fn event_loop(
        mut events: broadcast::Receiver<RadioEvent>,
        radio: Arc<dyn Radio>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(RadioEvent::AclConnected(device)) => {
                    Self::link_changed(radio.as_ref(), &shared, device, true).await;
                }
                Ok(RadioEvent::AclDisconnected(device)) => {
                    Self::link_changed(radio.as_ref(), &shared, device, false).await;
                }
                Ok(RadioEvent::RadioStateChanged { enabled: false }) => {
                    warn!("Bluetooth turned off, closing connection");
                    shared.close();
                    radio.request_enable().await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connection pump lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Link-level state change. Only bonded devices update the flags.
    async fn link_changed(radio: &dyn Radio, shared: &Shared, device: Device, connected: bool) {
        let bonded = match radio.bonded_devices().await {
            Ok(devices) => devices.contains(&device),
            Err(e) => {
                warn!("Failed to enumerate bonded devices: {}", e);
                false
            }
        };

        if bonded {
            debug!("Link to {} is {}", device, if connected { "up" } else { "down" });
            shared.last_connected.set(Some(device));
            shared.connected.set_if_changed(connected);
        } else {
            warn!("Link event from non-paired device {}", device);
            shared.publish_error(ChatError::NonPairedPeer(device.address));
        }
    }

    fn ensure_permitted(&self) -> Result<()> {
        if self.shared.released.load(Ordering::Acquire) {
            return Err(ChatError::Released);
        }
        if !self.permissions.has_capability(Capability::Connect) {
            debug!("Connect permission missing");
            return Err(ChatError::PermissionDenied(Capability::Connect));
        }
        Ok(())
    }

    /// Open a single-shot server and wait for one peer in the background.
    ///
    /// The listener is registered before this returns, so peers may
    /// connect as soon as it does.
    pub async fn listen_for_incoming(&self) -> Result<ConnectionEvents> {
        self.ensure_permitted()?;
        let cancel = self.shared.begin(|cancel| Session::Listening { cancel })?;
        let (tx, rx) = mpsc::channel(self.settings.event_capacity.max(1));

        let listener = match self
            .radio
            .listen(&self.settings.service_name, self.settings.service_uuid)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to open server socket: {}", e);
                Self::report_failure(&self.shared, &cancel, &tx, e.to_string()).await;
                return Ok(rx);
            }
        };

        info!(
            "RFCOMM server '{}' listening (UUID: {})",
            self.settings.service_name, self.settings.service_uuid
        );
        tokio::spawn(Self::accept_task(
            listener,
            self.shared.clone(),
            self.settings.clone(),
            cancel,
            tx,
        ));
        Ok(rx)
    }

    async fn accept_task(
        mut listener: Box<dyn RfcommListener>,
        shared: Arc<Shared>,
        settings: SessionSettings,
        cancel: CancellationToken,
        tx: mpsc::Sender<ConnectionEvent>,
    ) {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Server stopped before a peer connected");
                return;
            }
            accepted = with_timeout(settings.accept_timeout, listener.accept()) => accepted,
        };
        // Single-shot: stop listening once a peer is in (or accept failed).
        drop(listener);

        match accepted {
            Ok((socket, device)) => {
                info!("Connection from: {}", device);
                Self::install(&shared, &settings, &cancel, &tx, socket, device).await;
            }
            Err(e) => {
                error!("Accept error: {}", e);
                Self::report_failure(&shared, &cancel, &tx, e.to_string()).await;
            }
        }
    }

    /// Connect to `device` in the background.
    ///
    /// Discovery is cancelled before the handshake since scanning and
    /// connecting share the radio.
    pub fn connect(&self, device: &Device) -> Result<ConnectionEvents> {
        self.ensure_permitted()?;
        let cancel = self.shared.begin(|cancel| Session::Connecting { cancel })?;
        let (tx, rx) = mpsc::channel(self.settings.event_capacity.max(1));

        info!("Connecting to {}", device);
        tokio::spawn(Self::connect_task(
            self.radio.clone(),
            self.discovery.clone(),
            self.shared.clone(),
            self.settings.clone(),
            cancel,
            tx,
            device.clone(),
        ));
        Ok(rx)
    }

    async fn connect_task(
        radio: Arc<dyn Radio>,
        discovery: Arc<DiscoveryCoordinator>,
        shared: Arc<Shared>,
        settings: SessionSettings,
        cancel: CancellationToken,
        tx: mpsc::Sender<ConnectionEvent>,
        device: Device,
    ) {
        let mut socket = match radio.create_socket(&device, settings.service_uuid).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to create socket for {}: {}", device, e);
                Self::report_failure(&shared, &cancel, &tx, e.to_string()).await;
                return;
            }
        };

        if let Err(e) = discovery.stop().await {
            debug!("Discovery not cancelled before connect: {}", e);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Connect to {} cancelled", device);
                return;
            }
            result = with_timeout(settings.connect_timeout, socket.connect()) => result,
        };

        match result {
            Ok(()) => Self::install(&shared, &settings, &cancel, &tx, socket, device).await,
            Err(e) => {
                warn!("Connect to {} failed: {}", device, e);
                drop(socket);
                Self::report_failure(&shared, &cancel, &tx, e.to_string()).await;
            }
        }
    }

    async fn install(
        shared: &Shared,
        settings: &SessionSettings,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ConnectionEvent>,
        socket: BoxedSocket,
        device: Device,
    ) {
        let transport = Arc::new(TransportSession::with_chunk_size(
            socket,
            device.display_name(),
            settings.chunk_size,
            cancel.child_token(),
        ));

        if !shared.establish(cancel, transport, &device) {
            debug!("Connection to {} closed before it was established", device);
            return;
        }

        info!("Connected to {}", device);
        if tx.send(ConnectionEvent::Established { device }).await.is_err() {
            debug!("Connection result dropped, no listener");
        }
    }

    async fn report_failure(
        shared: &Shared,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ConnectionEvent>,
        reason: String,
    ) {
        if !shared.fail(cancel, &reason) {
            return;
        }
        shared.publish_error(ChatError::ConnectFailed(reason.clone()));
        if tx.send(ConnectionEvent::Error(reason)).await.is_err() {
            debug!("Connection result dropped, no listener");
        }
    }

    /// Close whatever the slot holds. Safe to call at any time.
    pub fn close_connection(&self) {
        self.shared.close();
    }

    /// Treat a failed receive on `transport` as a disconnect.
    ///
    /// Ignored if `transport` is no longer the active session.
    pub fn handle_transport_failure(&self, transport: &Arc<TransportSession>, error: ChatError) {
        let current = matches!(
            &*self.shared.session.lock(),
            Session::Connected { transport: active, .. } if Arc::ptr_eq(active, transport)
        );
        if !current {
            debug!("Ignoring failure of a stale transport: {}", error);
            return;
        }

        warn!("Transport to {} failed: {}", transport.peer_name(), error);
        self.shared.publish_error(error);
        self.shared.close();
    }

    /// Unsubscribe from radio events and close. The manager rejects all
    /// further attempts.
    pub fn release(&self) {
        self.shared.released.store(true, Ordering::Release);
        if let Some(cancel) = self.pump.lock().take() {
            cancel.cancel();
        }
        self.shared.close();
        info!("Connection manager released");
    }

    /// Active transport, if connected.
    pub fn transport(&self) -> Option<Arc<TransportSession>> {
        match &*self.shared.session.lock() {
            Session::Connected { transport, .. } => Some(transport.clone()),
            _ => None,
        }
    }

    /// Peer of the active transport, if connected.
    pub fn connected_device(&self) -> Option<Device> {
        match &*self.shared.session.lock() {
            Session::Connected { device, .. } => Some(device.clone()),
            _ => None,
        }
    }

    /// True while neither a listener, a pending connect nor a transport exists.
    pub fn is_idle(&self) -> bool {
        matches!(*self.shared.session.lock(), Session::Idle)
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.get()
    }

    pub fn last_connected_device(&self) -> Option<Device> {
        self.shared.last_connected.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn watch_last_connected(&self) -> watch::Receiver<Option<Device>> {
        self.shared.last_connected.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ChatError> {
        self.shared.errors.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.pump.get_mut().take() {
            cancel.cancel();
        }
        self.shared.close();
    }
}

/// Bound an I/O future by an optional limit.
async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                ChatError::Timeout.to_string(),
            ))
        }),
        None => fut.await,
    }
}
