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

//! Host collaborators: the radio, its sockets, and the permission predicate.
//!
//! The session core never talks to a Bluetooth stack directly. Everything
//! privileged goes through [`Radio`], and every privileged call is preceded
//! by a [`PermissionCheck`] query.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::device::Device;

/// Capability classes the host may grant or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Enumerate bonded devices and run discovery.
    Scan,
    /// Open, accept and use RFCOMM sockets.
    Connect,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Connect => "connect",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission predicate queried before every privileged radio operation.
pub trait PermissionCheck: Send + Sync {
    fn has_capability(&self, capability: Capability) -> bool;
}

impl<F> PermissionCheck for F
where
    F: Fn(Capability) -> bool + Send + Sync,
{
    fn has_capability(&self, capability: Capability) -> bool {
        self(capability)
    }
}

/// Grants every capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn has_capability(&self, _capability: Capability) -> bool {
        true
    }
}

/// Push-style notifications from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A device was seen during discovery.
    DeviceFound(Device),
    DiscoveryStarted,
    DiscoveryFinished,
    /// Link-level connection to a remote device came up.
    AclConnected(Device),
    /// Link-level connection to a remote device went down.
    AclDisconnected(Device),
    /// The adapter was powered on or off.
    RadioStateChanged { enabled: bool },
}

/// A byte-stream RFCOMM socket.
///
/// Client sockets are created unconnected and become usable after
/// [`connect`](RfcommSocket::connect) succeeds. Sockets handed out by a
/// listener are already connected. Dropping the socket closes it.
#[async_trait]
pub trait RfcommSocket: AsyncRead + AsyncWrite + Send + Unpin {
    fn is_connected(&self) -> bool;

    /// Perform the connect handshake with the remote service.
    async fn connect(&mut self) -> io::Result<()>;
}

pub type BoxedSocket = Box<dyn RfcommSocket>;

/// A listening RFCOMM handle. Dropping it stops listening.
#[async_trait]
pub trait RfcommListener: Send {
    /// Wait for the next peer.
    async fn accept(&mut self) -> io::Result<(BoxedSocket, Device)>;
}

/// The host's Bluetooth radio.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Name this radio advertises, if known.
    fn local_name(&self) -> Option<String>;

    async fn is_enabled(&self) -> bool;

    /// Ask the host to turn the radio on. Out-of-band; the outcome
    /// arrives later as [`RadioEvent::RadioStateChanged`].
    async fn request_enable(&self);

    async fn bonded_devices(&self) -> io::Result<Vec<Device>>;

    async fn start_discovery(&self) -> io::Result<()>;

    async fn cancel_discovery(&self) -> io::Result<()>;

    /// Register for radio events. Dropping the receiver unregisters.
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    /// Open a listening handle bound to a service record.
    async fn listen(&self, service_name: &str, uuid: Uuid) -> io::Result<Box<dyn RfcommListener>>;

    /// Create an unconnected client socket to `device`'s service.
    async fn create_socket(&self, device: &Device, uuid: Uuid) -> io::Result<BoxedSocket>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_permission_check() {
        let scan_only = |cap: Capability| cap == Capability::Scan;
        assert!(scan_only.has_capability(Capability::Scan));
        assert!(!scan_only.has_capability(Capability::Connect));
        assert!(AllowAll.has_capability(Capability::Connect));
    }
}
