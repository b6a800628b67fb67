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

//! RFCOMM chat session core.
//!
//! Discovers nearby devices, holds one RFCOMM connection at a time and
//! exchanges text messages over it. The Bluetooth stack is abstracted
//! behind [`bluetooth::Radio`]; [`bluetooth::MemoryRadio`] runs everything
//! in-process.

pub mod bluetooth;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod state;

pub use config::Config;
pub use controller::{BluetoothController, MessageLogStream};
pub use error::{ChatError, Result};
pub use events::{ConnectionEvent, ConnectionEvents};
pub use state::{ConnectionState, StateCell};
