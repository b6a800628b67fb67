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

//! Bluetooth communication module.
//!
//! Device lists, discovery, and the RFCOMM connection and transport used
//! to exchange chat messages with a single peer.

#[cfg(feature = "bluez")]
mod bluez;
mod device;
mod discovery;
mod manager;
pub mod memory;
mod protocol;
mod radio;
mod registry;
mod transport;

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
pub use device::{Address, Device, InvalidAddress};
pub use discovery::DiscoveryCoordinator;
pub use manager::{ConnectionManager, SessionSettings};
pub use memory::{MemoryAir, MemoryRadio, MemorySocket};
pub use protocol::{Message, CHUNK_SIZE, SERVICE_NAME, SERVICE_UUID, UNKNOWN_SENDER};
pub use radio::{
    AllowAll, BoxedSocket, Capability, PermissionCheck, Radio, RadioEvent, RfcommListener,
    RfcommSocket,
};
pub use registry::DeviceRegistry;
pub use transport::{MessageStream, TransportSession};
