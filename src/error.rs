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

//! Error types for the session core.

use thiserror::Error;

use crate::bluetooth::{Address, Capability};

/// Errors produced by discovery, connection and transport operations.
///
/// Socket errors are flattened to their message so the error can be
/// broadcast to every subscriber of the error stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("missing {0} permission")]
    PermissionDenied(Capability),

    #[error("Bluetooth radio is disabled")]
    RadioDisabled,

    #[error("radio error: {0}")]
    Radio(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("socket is not connected")]
    NotConnected,

    #[error("{0}")]
    ConnectFailed(String),

    #[error("Can't connect to a non-paired device ({0}).")]
    NonPairedPeer(Address),

    #[error("another connection attempt is in progress")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("message stream already taken")]
    ReceiverTaken,

    #[error("controller has been released")]
    Released,
}

impl ChatError {
    /// Wrap an I/O failure that happened mid-stream.
    pub fn transfer(err: &std::io::Error) -> Self {
        Self::TransferFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
