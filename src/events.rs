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

//! Connection lifecycle events.

use tokio::sync::mpsc;

use crate::bluetooth::Device;

/// Outcome of one connect or listen attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer is connected and the transport is ready.
    Established { device: Device },
    /// The attempt failed. Terminal for that attempt; nothing retries.
    Error(String),
}

impl ConnectionEvent {
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionEvent::Established { .. })
    }
}

/// In-order events of a single attempt.
pub type ConnectionEvents = mpsc::Receiver<ConnectionEvent>;
