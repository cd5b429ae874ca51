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
//! Scans for the collar, keeps the GATT link alive and turns telemetry
//! notifications into lines.

pub mod ble_constants;
mod central;
mod framing;
mod link;

pub use central::{BleCentral, CentralConfig, LinkHandle};
pub use framing::FrameAssembler;
pub use link::{
    CharRef, Command, DeviceId, GattLink, LinkConfig, LinkEvent, LinkState, LinkStateMachine,
    Output, Peripheral, RadioEvent, RadioRequest, RetryToken, ServiceInfo,
};
