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

//! Chat message definitions and wire encoding.
//!
//! The wire format carries no envelope: a message is the raw UTF-8 bytes of
//! its body, and the receiver treats every read chunk as one message. Long
//! bodies are therefore split across messages and back-to-back writes may
//! be merged into one. Existing Android peers expect exactly this.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service record UUID shared by listening and connecting sockets.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x27b7d1da_08c7_4505_a6d1_2459987e5e2d);

/// Service record name registered by the listening side.
pub const SERVICE_NAME: &str = "bluetooth_sample_service";

/// Size of a single socket read.
pub const CHUNK_SIZE: usize = 1024;

/// Sender name used when the radio does not report one.
pub const UNKNOWN_SENDER: &str = "Unknown name";

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    pub sender: String,
    /// True when produced on this endpoint, false when decoded from the peer.
    pub is_local: bool,
}

impl Message {
    /// Create a message originating on this endpoint.
    pub fn local(body: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            sender: sender.into(),
            is_local: true,
        }
    }

    /// Decode one read chunk from the peer.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; a chunk may end in
    /// the middle of a multi-byte sequence.
    pub fn from_chunk(chunk: &[u8], sender: impl Into<String>) -> Self {
        Self {
            body: String::from_utf8_lossy(chunk).into_owned(),
            sender: sender.into(),
            is_local: false,
        }
    }

    /// Bytes written to the socket for this message.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.body.as_bytes().to_vec()
    }
}
