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

//! Public facade over discovery, connections and the message log.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    Capability, ConnectionManager, Device, DeviceRegistry, DiscoveryCoordinator, Message,
    MessageStream, PermissionCheck, Radio, SessionSettings, TransportSession, UNKNOWN_SENDER,
};
use crate::error::{ChatError, Result};
use crate::events::ConnectionEvents;
use crate::state::{ConnectionState, StateCell};

/// Snapshots of the message log, one per received message.
pub type MessageLogStream = BoxStream<'static, Vec<Message>>;

/// Everything a chat front end needs: device lists, connection state,
/// the message log and the operations that drive them.
///
/// The message log grows for the lifetime of the controller.
pub struct BluetoothController {
    radio: Arc<dyn Radio>,
    permissions: Arc<dyn PermissionCheck>,
    registry: Arc<DeviceRegistry>,
    discovery: Arc<DiscoveryCoordinator>,
    manager: Arc<ConnectionManager>,
    messages: Arc<StateCell<Vec<Message>>>,
    last_error: Arc<StateCell<Option<String>>>,
    pump: Mutex<Option<CancellationToken>>,
}

impl BluetoothController {
    /// Wire up the components, subscribe to radio events and load the
    /// paired list. Must be called inside a tokio runtime.
    pub async fn new(
        radio: Arc<dyn Radio>,
        permissions: Arc<dyn PermissionCheck>,
        settings: SessionSettings,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let discovery = Arc::new(DiscoveryCoordinator::new(
            radio.clone(),
            permissions.clone(),
            registry.clone(),
        ));
        let manager = Arc::new(ConnectionManager::new(
            radio.clone(),
            permissions.clone(),
            discovery.clone(),
            settings,
        ));

        discovery.attach();
        manager.attach();

        let last_error = Arc::new(StateCell::new(None));
        let cancel = CancellationToken::new();
        tokio::spawn(Self::error_loop(
            manager.subscribe_errors(),
            last_error.clone(),
            cancel.clone(),
        ));

        registry
            .refresh_paired(radio.as_ref(), permissions.as_ref())
            .await;

        Self {
            radio,
            permissions,
            registry,
            discovery,
            manager,
            messages: Arc::new(StateCell::new(Vec::new())),
            last_error,
            pump: Mutex::new(Some(cancel)),
        }
    }

    async fn error_loop(
        mut errors: broadcast::Receiver<ChatError>,
        last_error: Arc<StateCell<Option<String>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let error = tokio::select! {
                _ = cancel.cancelled() => break,
                error = errors.recv() => error,
            };

            match error {
                Ok(error) => last_error.set(Some(error.to_string())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Error pump lagged, {} errors dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Refresh paired devices and start scanning.
    ///
    /// A missing permission or a powered-off radio is logged and ignored.
    pub async fn start_discovery(&self) {
        match self.discovery.start().await {
            Ok(()) => {}
            Err(e @ (ChatError::PermissionDenied(_) | ChatError::RadioDisabled)) => {
                debug!("Discovery not started: {}", e);
            }
            Err(e) => {
                warn!("Discovery failed to start: {}", e);
                self.last_error.set(Some(e.to_string()));
            }
        }
    }

    /// Stop scanning. Errors are handled as in
    /// [`start_discovery`](Self::start_discovery).
    pub async fn stop_discovery(&self) {
        match self.discovery.stop().await {
            Ok(()) => {}
            Err(e @ (ChatError::PermissionDenied(_) | ChatError::RadioDisabled)) => {
                debug!("Discovery not stopped: {}", e);
            }
            Err(e) => {
                warn!("Discovery failed to stop: {}", e);
                self.last_error.set(Some(e.to_string()));
            }
        }
    }

    /// Connect to `device` as a client.
    pub fn connect_to_device(&self, device: &Device) -> Result<ConnectionEvents> {
        self.manager.connect(device)
    }

    /// Wait for one incoming peer.
    pub async fn start_server(&self) -> Result<ConnectionEvents> {
        self.manager.listen_for_incoming().await
    }

    /// Send `text` to the connected peer.
    ///
    /// Returns `None` only when the connect permission is missing.
    /// Otherwise the built message is returned; it is added to the log
    /// only if the write succeeded.
    pub async fn try_send_message(&self, text: &str) -> Option<Message> {
        if !self.permissions.has_capability(Capability::Connect) {
            debug!("Connect permission missing, message not sent");
            return None;
        }

        let sender = self
            .radio
            .local_name()
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let message = Message::local(text, sender);

        let sent = match self.manager.transport() {
            Some(transport) => transport.send(&message.to_bytes()).await,
            None => {
                debug!("Not connected, message not sent");
                false
            }
        };

        if sent {
            self.messages.update(|log| {
                log.push(message.clone());
                true
            });
        }
        Some(message)
    }

    /// Receive from the active transport, yielding the whole log after
    /// each message.
    ///
    /// The stream ends when the transport fails or is closed. A failure is
    /// treated as a disconnect.
    pub fn subscribe_messages(&self) -> Result<MessageLogStream> {
        let transport = self.manager.transport().ok_or(ChatError::NotConnected)?;
        let incoming = transport.receive_stream();

        let state = ReceiveLoop {
            incoming,
            transport,
            manager: self.manager.clone(),
            messages: self.messages.clone(),
        };

        Ok(stream::unfold(Some(state), |state| async move {
            let mut st = state?;

            match st.incoming.next().await {
                Some(Ok(message)) => {
                    debug!("Message from {}: {} bytes", message.sender, message.body.len());
                    st.messages.update(|log| {
                        log.push(message);
                        true
                    });
                    let snapshot = st.messages.get();
                    Some((snapshot, Some(st)))
                }
                Some(Err(ChatError::ReceiverTaken)) => {
                    warn!("Messages are already being received on this connection");
                    None
                }
                Some(Err(e)) => {
                    st.manager.handle_transport_failure(&st.transport, e);
                    None
                }
                None => None,
            }
        })
        .boxed())
    }

    /// Close the active connection or pending attempt.
    pub fn close_connection(&self) {
        self.manager.close_connection();
    }

    /// Unsubscribe everything and close. The controller is unusable
    /// afterwards.
    pub fn release(&self) {
        if let Some(cancel) = self.pump.lock().take() {
            cancel.cancel();
        }
        self.discovery.detach();
        self.manager.release();
        info!("Bluetooth controller released");
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.get()
    }

    pub fn scanned_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.registry.watch_scanned()
    }

    pub fn paired_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.registry.watch_paired()
    }

    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.discovery.watch_scanning()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.manager.watch_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    pub fn last_connected_device(&self) -> watch::Receiver<Option<Device>> {
        self.manager.watch_last_connected()
    }

    /// Most recent error message.
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    /// Every error published by the connection manager.
    pub fn errors(&self) -> broadcast::Receiver<ChatError> {
        self.manager.subscribe_errors()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

impl Drop for BluetoothController {
    fn drop(&mut self) {
        if let Some(cancel) = self.pump.get_mut().take() {
            cancel.cancel();
        }
    }
}

struct ReceiveLoop {
    incoming: MessageStream,
    transport: Arc<TransportSession>,
    manager: Arc<ConnectionManager>,
    messages: Arc<StateCell<Vec<Message>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bluetooth::{Address, AllowAll, MemoryAir, MemoryRadio};
    use crate::events::ConnectionEvent;

    async fn controller(radio: &MemoryRadio) -> BluetoothController {
        controller_with(radio, Arc::new(AllowAll)).await
    }

    async fn controller_with(
        radio: &MemoryRadio,
        permissions: Arc<dyn PermissionCheck>,
    ) -> BluetoothController {
        BluetoothController::new(
            Arc::new(radio.clone()),
            permissions,
            SessionSettings::default(),
        )
        .await
    }

    async fn established(events: &mut ConnectionEvents) {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no connection event")
            .expect("event channel closed");
        assert!(event.is_established(), "unexpected event: {:?}", event);
    }

    async fn connected_pair() -> (MemoryRadio, MemoryRadio, BluetoothController, BluetoothController) {
        let air = MemoryAir::new();
        let a = air.radio(Address::new([0xA; 6]), "Alice");
        let b = air.radio(Address::new([0xB; 6]), "Bob");
        let client = controller(&a).await;
        let server = controller(&b).await;

        let mut server_events = server.start_server().await.unwrap();
        let mut client_events = client.connect_to_device(&b.device()).unwrap();
        established(&mut client_events).await;
        established(&mut server_events).await;
        (a, b, client, server)
    }

    #[tokio::test]
    async fn test_new_loads_paired_devices() {
        let air = MemoryAir::new();
        let a = air.radio(Address::new([1; 6]), "a");
        let bonded = Device::new(Address::new([9; 6]), "phone");
        a.set_bonded(vec![bonded.clone()]);

        let controller = controller(&a).await;
        assert_eq!(*controller.paired_devices().borrow(), vec![bonded]);
    }

    #[tokio::test]
    async fn test_send_without_connection_is_not_logged() {
        let air = MemoryAir::new();
        let a = air.radio(Address::new([1; 6]), "a");
        let controller = controller(&a).await;

        let unsent = controller.try_send_message("hello").await.unwrap();
        assert_eq!(unsent.body, "hello");
        assert!(controller.messages().is_empty());
        assert!(matches!(
            controller.subscribe_messages().err(),
            Some(ChatError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (_a, _b, client, server) = connected_pair().await;
        let mut server_log = server.subscribe_messages().unwrap();

        let sent = client.try_send_message("hi").await.unwrap();
        assert!(sent.is_local);
        assert_eq!(sent.sender, "Alice");
        assert_eq!(client.messages(), vec![sent]);

        let snapshot = tokio::time::timeout(Duration::from_secs(1), server_log.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].body, "hi");
        assert_eq!(snapshot[0].sender, "Alice");
        assert!(!snapshot[0].is_local);

        let reply = server.try_send_message("hey").await.unwrap();
        assert_eq!(reply.sender, "Bob");
        assert_eq!(server.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_returns_unlogged_message() {
        let (_a, _b, client, server) = connected_pair().await;
        server.close_connection();
        // the client has not noticed the hang-up yet
        assert!(client.is_connected());

        let message = client.try_send_message("hi").await.unwrap();
        assert_eq!(message.body, "hi");
        assert!(message.is_local);
        assert!(client.messages().is_empty());
    }

    #[tokio::test]
    async fn test_close_with_idle_subscription_disconnects_peer() {
        let (_a, _b, client, server) = connected_pair().await;
        let _client_log = client.subscribe_messages().unwrap();
        let mut server_log = server.subscribe_messages().unwrap();

        client.close_connection();
        assert!(!client.is_connected());

        let end = tokio::time::timeout(Duration::from_secs(2), server_log.next())
            .await
            .expect("peer still connected after close");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_send_without_connect_permission() {
        let (_a, _b, client, _server) = connected_pair().await;
        let air = MemoryAir::new();
        let c = air.radio(Address::new([0xC; 6]), "c");
        let denied = controller_with(&c, Arc::new(|_: Capability| false)).await;

        assert!(denied.try_send_message("x").await.is_none());
        assert!(client.try_send_message("x").await.is_some());
    }

    #[tokio::test]
    async fn test_peer_drop_marks_disconnected() {
        let (_a, _b, client, server) = connected_pair().await;
        let mut server_log = server.subscribe_messages().unwrap();
        let mut connected = server.connected();
        let mut last_error = server.last_error();
        assert!(*connected.borrow());

        client.close_connection();

        let end = tokio::time::timeout(Duration::from_secs(1), server_log.next())
            .await
            .unwrap();
        assert!(end.is_none());
        connected.wait_for(|c| !*c).await.unwrap();
        last_error.wait_for(|e| e.is_some()).await.unwrap();
        let before = server.messages().len();
        assert!(server.try_send_message("anyone?").await.is_some());
        assert_eq!(server.messages().len(), before);
        assert_eq!(*server.connection_state().borrow(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_discovery_errors_are_swallowed() {
        let air = MemoryAir::new();
        let a = air.radio(Address::new([1; 6]), "a");
        a.set_enabled(false);
        let controller = controller(&a).await;

        controller.start_discovery().await;
        controller.stop_discovery().await;
        assert_eq!(a.enable_requests(), 2);
        assert!(controller.last_error().borrow().is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_sets_last_error() {
        let air = MemoryAir::new();
        let a = air.radio(Address::new([1; 6]), "a");
        let b = air.radio(Address::new([2; 6]), "b");
        let controller = controller(&a).await;
        let mut last_error = controller.last_error();

        let mut events = controller.connect_to_device(&b.device()).unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Error(_))
        ));
        last_error.wait_for(|e| e.is_some()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_closes_connection() {
        let (_a, _b, client, _server) = connected_pair().await;

        client.release();
        assert!(!client.is_connected());
        assert!(client.try_send_message("late").await.is_some());
        assert!(client.messages().iter().all(|m| m.body != "late"));
        assert_eq!(
            client.connect_to_device(&Device::new(Address::new([3; 6]), "x")).unwrap_err(),
            ChatError::Released
        );
    }
}
