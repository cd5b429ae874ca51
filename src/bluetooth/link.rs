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

//! Connection lifecycle of the collar link.
//!
//! [`LinkStateMachine`] performs no I/O. Public operations and [`RadioEvent`]s
//! go in, [`Output`]s come out: [`RadioRequest`]s for the radio stack and
//! [`LinkEvent`]s for the coordinator. The caller must deliver every input
//! from one serialized context.

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{
    self, COMMAND_RX_UUID, PRODUCT_NAME_FILTER, SERVICE_UUID, TELEMETRY_TX_UUID,
};
use super::framing::FrameAssembler;

/// Observable state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Negotiating,
    Subscribing,
    Streaming,
    Disconnecting,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Scanning => "Scanning",
            LinkState::Connecting => "Connecting",
            LinkState::Negotiating => "Negotiating",
            LinkState::Subscribing => "Subscribing",
            LinkState::Streaming => "Streaming",
            LinkState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radio-stack identifier of a remote device (the BlueZ address on Linux).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The one collar a connection attempt is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: DeviceId,
    pub name: String,
}

/// Address of a characteristic inside the remote GATT database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// A negotiated connection: the peripheral plus its characteristic references.
///
/// Exists only while the link is subscribing or streaming, so the handle and
/// the characteristics are released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattLink {
    pub peripheral: Peripheral,
    pub telemetry: CharRef,
    pub command: Option<CharRef>,
}

/// One primary service reported by service discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Identifies one scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryToken(u64);

/// Outbound command tokens understood by the collar firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
        }
    }
}

/// Callbacks from the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// The adapter is absent or powered off.
    AdapterUnavailable,
    /// A device was seen while scanning.
    DeviceDiscovered { id: DeviceId, name: Option<String> },
    /// The scan could not be started or aborted.
    DiscoveryFailed(String),
    /// Connection request succeeded.
    Connected(DeviceId),
    /// Connection request failed or timed out.
    ConnectFailed { id: DeviceId, reason: String },
    /// Remote GATT database resolved.
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<ServiceInfo>,
    },
    /// Remote GATT database could not be read.
    ServiceDiscoveryFailed { id: DeviceId, reason: String },
    /// Notifications on the telemetry characteristic are on.
    NotificationsEnabled(DeviceId),
    /// Notifications could not be enabled.
    SubscribeFailed { id: DeviceId, reason: String },
    /// Telemetry notification payload.
    Notification { id: DeviceId, value: Vec<u8> },
    /// The link dropped.
    LinkLost { id: DeviceId, reason: String },
    /// A scheduled retry delay ran out.
    RetryElapsed(RetryToken),
}

/// Requests for the radio stack. All are fire-and-forget; results come back
/// as [`RadioEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioRequest {
    StartDiscovery,
    StopDiscovery,
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    EnableNotifications {
        id: DeviceId,
        characteristic: CharRef,
    },
    Write {
        id: DeviceId,
        characteristic: CharRef,
        value: Vec<u8>,
    },
    /// Close the connection handle and drop characteristic references.
    Close(DeviceId),
    ScheduleRetry {
        token: RetryToken,
        delay: Duration,
    },
    CancelRetry(RetryToken),
}

/// Events for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Streaming from the named collar.
    Connected { device_name: String },
    /// The link was lost or negotiation failed.
    Disconnected,
    /// One complete telemetry line.
    LineReceived(String),
    /// Advisory status text.
    Status(String),
}

/// Everything the state machine asks its driver to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Request(RadioRequest),
    Event(LinkEvent),
}

/// Link tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Case-insensitive substring matched against advertised names.
    pub name_filter: String,
    /// Delay between a link loss and the next scan.
    pub retry_delay: Duration,
    /// Consecutive failed cycles tolerated; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name_filter: PRODUCT_NAME_FILTER.to_string(),
            retry_delay: ble_constants::config::RETRY_DELAY,
            max_retries: None,
        }
    }
}

enum Phase {
    Idle,
    Scanning,
    Connecting(Peripheral),
    Negotiating(Peripheral),
    Subscribing(GattLink),
    Streaming(GattLink),
}

impl Phase {
    fn state(&self) -> LinkState {
        match self {
            Phase::Idle => LinkState::Idle,
            Phase::Scanning => LinkState::Scanning,
            Phase::Connecting(_) => LinkState::Connecting,
            Phase::Negotiating(_) => LinkState::Negotiating,
            Phase::Subscribing(_) => LinkState::Subscribing,
            Phase::Streaming(_) => LinkState::Streaming,
        }
    }

    fn peripheral(&self) -> Option<&Peripheral> {
        match self {
            Phase::Idle | Phase::Scanning => None,
            Phase::Connecting(p) | Phase::Negotiating(p) => Some(p),
            Phase::Subscribing(link) | Phase::Streaming(link) => Some(&link.peripheral),
        }
    }
}

/// Scan, connect, negotiate, subscribe, stream, and retry after every loss.
pub struct LinkStateMachine {
    config: LinkConfig,
    phase: Phase,
    assembler: FrameAssembler,
    pending_retry: Option<RetryToken>,
    next_token: u64,
    failures: u32,
    outputs: Vec<Output>,
}

impl LinkStateMachine {
    /// Create an idle state machine.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            assembler: FrameAssembler::new(),
            pending_retry: None,
            next_token: 0,
            failures: 0,
            outputs: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.phase.state()
    }

    /// True while the command and telemetry paths are usable.
    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming(_))
    }

    /// Peripheral bound to the current connection attempt.
    pub fn peripheral(&self) -> Option<&Peripheral> {
        self.phase.peripheral()
    }

    pub fn pending_retry(&self) -> Option<RetryToken> {
        self.pending_retry
    }

    /// Begin scanning. Ignored unless idle.
    pub fn start(&mut self) -> Vec<Output> {
        if matches!(self.phase, Phase::Idle) {
            self.cancel_retry();
            self.failures = 0;
            self.begin_scan();
        } else {
            debug!("start() ignored in state {}", self.state());
        }
        self.take_outputs()
    }

    /// Tear everything down and go idle. Always succeeds.
    pub fn stop(&mut self) -> Vec<Output> {
        self.cancel_retry();
        self.failures = 0;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Scanning => {
                info!("Link Scanning -> Idle");
                self.request(RadioRequest::StopDiscovery);
            }
            phase => {
                let from = phase.state();
                if let Some(peripheral) = phase.peripheral() {
                    info!("Link {} -> {}", from, LinkState::Disconnecting);
                    self.request(RadioRequest::Close(peripheral.id.clone()));
                }
                info!("Link {} -> {}", LinkState::Disconnecting, LinkState::Idle);
            }
        }
        self.assembler.reset();
        self.take_outputs()
    }

    /// Write a command token to the collar. No-op unless streaming.
    pub fn send_command(&mut self, command: Command) -> Vec<Output> {
        match &self.phase {
            Phase::Streaming(link) => match link.command {
                Some(characteristic) => {
                    info!("Sending command {}", command.as_str());
                    let request = RadioRequest::Write {
                        id: link.peripheral.id.clone(),
                        characteristic,
                        value: command.as_str().as_bytes().to_vec(),
                    };
                    self.request(request);
                }
                None => warn!(
                    "Command {} dropped: collar has no command characteristic",
                    command.as_str()
                ),
            },
            _ => debug!(
                "Command {} dropped in state {}",
                command.as_str(),
                self.state()
            ),
        }
        self.take_outputs()
    }

    /// Apply one radio-stack callback.
    pub fn handle(&mut self, event: RadioEvent) -> Vec<Output> {
        match event {
            RadioEvent::AdapterUnavailable => self.on_adapter_unavailable(),
            RadioEvent::DeviceDiscovered { id, name } => self.on_discovered(id, name),
            RadioEvent::DiscoveryFailed(reason) => self.on_discovery_failed(&reason),
            RadioEvent::Connected(id) => self.on_connected(id),
            RadioEvent::ConnectFailed { id, reason } => {
                if self.is_current(&id) && self.state() == LinkState::Connecting {
                    self.fail_link(&format!("connect failed: {}", reason));
                }
            }
            RadioEvent::ServicesDiscovered { id, services } => {
                self.on_services_discovered(id, &services)
            }
            RadioEvent::ServiceDiscoveryFailed { id, reason } => {
                if self.is_current(&id) && self.state() == LinkState::Negotiating {
                    self.fail_link(&format!("service discovery failed: {}", reason));
                }
            }
            RadioEvent::NotificationsEnabled(id) => self.on_subscribed(id),
            RadioEvent::SubscribeFailed { id, reason } => {
                if self.is_current(&id) && self.state() == LinkState::Subscribing {
                    self.fail_link(&format!("subscribe failed: {}", reason));
                }
            }
            RadioEvent::Notification { id, value } => self.on_notification(&id, &value),
            RadioEvent::LinkLost { id, reason } => {
                if self.is_current(&id) {
                    self.fail_link(&reason);
                } else {
                    debug!("Ignoring link loss from {}", id);
                }
            }
            RadioEvent::RetryElapsed(token) => self.on_retry_elapsed(token),
        }
        self.take_outputs()
    }

    fn on_adapter_unavailable(&mut self) {
        if matches!(self.phase, Phase::Scanning) {
            warn!("Bluetooth adapter unavailable");
            self.set_phase(Phase::Idle);
            self.emit(LinkEvent::Status("Bluetooth disabled".to_string()));
        }
    }

    fn on_discovered(&mut self, id: DeviceId, name: Option<String>) {
        if !matches!(self.phase, Phase::Scanning) {
            return;
        }
        let Some(name) = name else {
            return;
        };
        if !ble_constants::matches_product(&name, &self.config.name_filter) {
            debug!("Skipping {} ({})", name, id);
            return;
        }

        info!("Found collar {} ({})", name, id);
        self.request(RadioRequest::StopDiscovery);
        self.emit(LinkEvent::Status(format!("Connecting to {}", name)));
        self.request(RadioRequest::Connect(id.clone()));
        self.set_phase(Phase::Connecting(Peripheral { id, name }));
    }

    fn on_discovery_failed(&mut self, reason: &str) {
        if !matches!(self.phase, Phase::Scanning) {
            return;
        }
        warn!("Discovery failed: {}", reason);
        self.request(RadioRequest::StopDiscovery);
        self.set_phase(Phase::Idle);
        self.schedule_retry();
    }

    fn on_connected(&mut self, id: DeviceId) {
        match &self.phase {
            Phase::Connecting(p) if p.id == id => {
                let peripheral = p.clone();
                self.request(RadioRequest::DiscoverServices(id));
                self.set_phase(Phase::Negotiating(peripheral));
            }
            _ if self.is_current(&id) => debug!("Duplicate connect callback from {}", id),
            _ => {
                warn!("Closing unexpected connection to {}", id);
                self.request(RadioRequest::Close(id));
            }
        }
    }

    fn on_services_discovered(&mut self, id: DeviceId, services: &[ServiceInfo]) {
        let peripheral = match &self.phase {
            Phase::Negotiating(p) if p.id == id => p.clone(),
            _ => return,
        };

        let Some(service) = services.iter().find(|s| s.uuid == SERVICE_UUID) else {
            self.fail_link("telemetry service missing");
            return;
        };
        let has = |uuid: Uuid| service.characteristics.contains(&uuid);

        if !has(TELEMETRY_TX_UUID) {
            self.fail_link("telemetry characteristic missing");
            return;
        }

        let telemetry = CharRef {
            service: SERVICE_UUID,
            characteristic: TELEMETRY_TX_UUID,
        };
        let command = has(COMMAND_RX_UUID).then_some(CharRef {
            service: SERVICE_UUID,
            characteristic: COMMAND_RX_UUID,
        });

        self.request(RadioRequest::EnableNotifications {
            id,
            characteristic: telemetry,
        });
        self.set_phase(Phase::Subscribing(GattLink {
            peripheral,
            telemetry,
            command,
        }));
    }

    fn on_subscribed(&mut self, id: DeviceId) {
        let link = match &self.phase {
            Phase::Subscribing(link) if link.peripheral.id == id => link.clone(),
            _ => return,
        };
        let device_name = link.peripheral.name.clone();
        self.failures = 0;
        self.assembler.reset();
        self.set_phase(Phase::Streaming(link));
        self.emit(LinkEvent::Connected { device_name });
    }

    fn on_notification(&mut self, id: &DeviceId, value: &[u8]) {
        let active = matches!(&self.phase, Phase::Streaming(link) if &link.peripheral.id == id);
        if !active {
            debug!("Ignoring {} byte notification from {}", value.len(), id);
            return;
        }
        for line in self.assembler.feed(value) {
            self.emit(LinkEvent::LineReceived(line));
        }
    }

    fn on_retry_elapsed(&mut self, token: RetryToken) {
        if self.pending_retry != Some(token) {
            debug!("Ignoring stale retry {:?}", token);
            return;
        }
        self.pending_retry = None;
        if matches!(self.phase, Phase::Idle) {
            info!("Retrying scan");
            self.begin_scan();
        }
    }

    fn fail_link(&mut self, reason: &str) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let from = phase.state();
        warn!("Link lost in state {}: {}", from, reason);

        if let Some(peripheral) = phase.peripheral() {
            self.request(RadioRequest::Close(peripheral.id.clone()));
        }
        self.assembler.reset();
        info!("Link {} -> {}", from, LinkState::Idle);

        self.emit(LinkEvent::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.failures += 1;
        if let Some(max) = self.config.max_retries {
            if self.failures > max {
                warn!("Giving up after {} failed attempts", max);
                self.emit(LinkEvent::Status(format!(
                    "Giving up after {} attempts",
                    max
                )));
                return;
            }
        }

        self.cancel_retry();
        let token = RetryToken(self.next_token);
        self.next_token += 1;
        self.pending_retry = Some(token);
        debug!(
            "Retry {:?} in {:?} (attempt {})",
            token, self.config.retry_delay, self.failures
        );
        self.request(RadioRequest::ScheduleRetry {
            token,
            delay: self.config.retry_delay,
        });
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.pending_retry.take() {
            debug!("Cancelling retry {:?}", token);
            self.request(RadioRequest::CancelRetry(token));
        }
    }

    fn begin_scan(&mut self) {
        self.set_phase(Phase::Scanning);
        self.emit(LinkEvent::Status("Scanning...".to_string()));
        self.request(RadioRequest::StartDiscovery);
    }

    fn is_current(&self, id: &DeviceId) -> bool {
        self.phase.peripheral().is_some_and(|p| &p.id == id)
    }

    fn set_phase(&mut self, phase: Phase) {
        let from = self.phase.state();
        let to = phase.state();
        if from != to {
            info!("Link {} -> {}", from, to);
        }
        self.phase = phase;
    }

    fn request(&mut self, request: RadioRequest) {
        self.outputs.push(Output::Request(request));
    }

    fn emit(&mut self, event: LinkEvent) {
        self.outputs.push(Output::Event(event));
    }

    fn take_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collar() -> DeviceId {
        DeviceId::new("C0:FF:EE:00:00:07")
    }

    fn nus_services() -> Vec<ServiceInfo> {
        vec![
            ServiceInfo {
                uuid: Uuid::from_u128(0x1800),
                characteristics: vec![Uuid::from_u128(0x2a00)],
            },
            ServiceInfo {
                uuid: SERVICE_UUID,
                characteristics: vec![COMMAND_RX_UUID, TELEMETRY_TX_UUID],
            },
        ]
    }

    fn requests(outputs: &[Output]) -> Vec<RadioRequest> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Request(r) => Some(r.clone()),
                Output::Event(_) => None,
            })
            .collect()
    }

    fn events(outputs: &[Output]) -> Vec<LinkEvent> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e.clone()),
                Output::Request(_) => None,
            })
            .collect()
    }

    fn retry_token(outputs: &[Output]) -> Option<RetryToken> {
        requests(outputs).into_iter().find_map(|r| match r {
            RadioRequest::ScheduleRetry { token, .. } => Some(token),
            _ => None,
        })
    }

    fn streaming_machine() -> LinkStateMachine {
        let mut link = LinkStateMachine::default();
        link.start();
        link.handle(RadioEvent::DeviceDiscovered {
            id: collar(),
            name: Some("My-DOGFIT-IMU-7".to_string()),
        });
        link.handle(RadioEvent::Connected(collar()));
        link.handle(RadioEvent::ServicesDiscovered {
            id: collar(),
            services: nus_services(),
        });
        link.handle(RadioEvent::NotificationsEnabled(collar()));
        assert_eq!(link.state(), LinkState::Streaming);
        link
    }

    #[test]
    fn test_start_scans_once() {
        let mut link = LinkStateMachine::default();
        let out = link.start();
        assert_eq!(link.state(), LinkState::Scanning);
        assert_eq!(requests(&out), vec![RadioRequest::StartDiscovery]);
        assert_eq!(
            events(&out),
            vec![LinkEvent::Status("Scanning...".to_string())]
        );

        assert!(link.start().is_empty());
        assert_eq!(link.state(), LinkState::Scanning);
    }

    #[test]
    fn test_full_handshake() {
        let mut link = LinkStateMachine::default();
        link.start();

        let out = link.handle(RadioEvent::DeviceDiscovered {
            id: collar(),
            name: Some("My-DOGFIT-IMU-7".to_string()),
        });
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(
            requests(&out),
            vec![
                RadioRequest::StopDiscovery,
                RadioRequest::Connect(collar())
            ]
        );

        let out = link.handle(RadioEvent::Connected(collar()));
        assert_eq!(link.state(), LinkState::Negotiating);
        assert_eq!(requests(&out), vec![RadioRequest::DiscoverServices(collar())]);

        let out = link.handle(RadioEvent::ServicesDiscovered {
            id: collar(),
            services: nus_services(),
        });
        assert_eq!(link.state(), LinkState::Subscribing);
        assert!(matches!(
            requests(&out)[0],
            RadioRequest::EnableNotifications { ref characteristic, .. }
                if characteristic.characteristic == TELEMETRY_TX_UUID
        ));

        let out = link.handle(RadioEvent::NotificationsEnabled(collar()));
        assert!(link.is_streaming());
        assert_eq!(
            events(&out),
            vec![LinkEvent::Connected {
                device_name: "My-DOGFIT-IMU-7".to_string()
            }]
        );
    }

    #[test]
    fn test_unnamed_and_foreign_devices_are_ignored() {
        let mut link = LinkStateMachine::default();
        link.start();
        assert!(link
            .handle(RadioEvent::DeviceDiscovered {
                id: DeviceId::new("AA"),
                name: None,
            })
            .is_empty());
        assert!(link
            .handle(RadioEvent::DeviceDiscovered {
                id: DeviceId::new("BB"),
                name: Some("Speaker".to_string()),
            })
            .is_empty());
        assert_eq!(link.state(), LinkState::Scanning);
    }

    #[test]
    fn test_first_match_wins() {
        let mut link = LinkStateMachine::default();
        link.start();
        link.handle(RadioEvent::DeviceDiscovered {
            id: collar(),
            name: Some("dogfit-imu-1".to_string()),
        });
        let out = link.handle(RadioEvent::DeviceDiscovered {
            id: DeviceId::new("OTHER"),
            name: Some("dogfit-imu-2".to_string()),
        });
        assert!(out.is_empty());
        assert_eq!(link.peripheral().map(|p| p.id.clone()), Some(collar()));
    }

    #[test]
    fn test_notifications_become_lines() {
        let mut link = streaming_machine();
        let out = link.handle(RadioEvent::Notification {
            id: collar(),
            value: b"10,0.1,0.2".to_vec(),
        });
        assert!(out.is_empty());

        let out = link.handle(RadioEvent::Notification {
            id: collar(),
            value: b",0.3\n20,0.4,0.5,0.6\n".to_vec(),
        });
        assert_eq!(
            events(&out),
            vec![
                LinkEvent::LineReceived("10,0.1,0.2,0.3".to_string()),
                LinkEvent::LineReceived("20,0.4,0.5,0.6".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_telemetry_characteristic_fails_negotiation() {
        let mut link = LinkStateMachine::default();
        link.start();
        link.handle(RadioEvent::DeviceDiscovered {
            id: collar(),
            name: Some("DOGFIT-IMU".to_string()),
        });
        link.handle(RadioEvent::Connected(collar()));
        let out = link.handle(RadioEvent::ServicesDiscovered {
            id: collar(),
            services: vec![ServiceInfo {
                uuid: SERVICE_UUID,
                characteristics: vec![COMMAND_RX_UUID],
            }],
        });

        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(events(&out), vec![LinkEvent::Disconnected]);
        let reqs = requests(&out);
        assert_eq!(reqs[0], RadioRequest::Close(collar()));
        assert!(retry_token(&out).is_some());
    }

    #[test]
    fn test_disconnect_while_streaming_retries_once() {
        let mut link = streaming_machine();
        let out = link.handle(RadioEvent::LinkLost {
            id: collar(),
            reason: "supervision timeout".to_string(),
        });

        assert_eq!(link.state(), LinkState::Idle);
        assert!(!link.is_streaming());
        assert_eq!(events(&out), vec![LinkEvent::Disconnected]);
        let scheduled = requests(&out)
            .iter()
            .filter(|r| matches!(r, RadioRequest::ScheduleRetry { .. }))
            .count();
        assert_eq!(scheduled, 1);

        // A second loss report for the same link changes nothing.
        let out = link.handle(RadioEvent::LinkLost {
            id: collar(),
            reason: "again".to_string(),
        });
        assert!(out.is_empty());

        let token = link.pending_retry().unwrap();
        let out = link.handle(RadioEvent::RetryElapsed(token));
        assert_eq!(link.state(), LinkState::Scanning);
        assert!(requests(&out).contains(&RadioRequest::StartDiscovery));
    }

    #[test]
    fn test_retry_uses_configured_delay() {
        let mut link = LinkStateMachine::new(LinkConfig {
            retry_delay: Duration::from_millis(250),
            ..LinkConfig::default()
        });
        link.start();
        let out = link.handle(RadioEvent::DiscoveryFailed("busy".to_string()));
        assert!(requests(&out).iter().any(|r| matches!(
            r,
            RadioRequest::ScheduleRetry { delay, .. } if *delay == Duration::from_millis(250)
        )));
        // No peripheral was involved, so no disconnect is reported.
        assert!(events(&out).is_empty());
    }

    #[test]
    fn test_stop_from_every_state_ends_idle() {
        fn idle(_: &mut LinkStateMachine) {}
        fn scanning(l: &mut LinkStateMachine) {
            l.start();
        }
        fn connecting(l: &mut LinkStateMachine) {
            scanning(l);
            l.handle(RadioEvent::DeviceDiscovered {
                id: collar(),
                name: Some("DOGFIT-IMU".to_string()),
            });
        }
        fn negotiating(l: &mut LinkStateMachine) {
            connecting(l);
            l.handle(RadioEvent::Connected(collar()));
        }
        fn subscribing(l: &mut LinkStateMachine) {
            negotiating(l);
            l.handle(RadioEvent::ServicesDiscovered {
                id: collar(),
                services: nus_services(),
            });
        }
        let setups: [fn(&mut LinkStateMachine); 5] =
            [idle, scanning, connecting, negotiating, subscribing];

        for setup in setups {
            let mut link = LinkStateMachine::default();
            setup(&mut link);
            link.stop();
            assert_eq!(link.state(), LinkState::Idle);
            assert!(link.peripheral().is_none());
            assert!(link.pending_retry().is_none());
        }

        let mut link = LinkStateMachine::default();
        subscribing(&mut link);
        assert_eq!(link.state(), LinkState::Subscribing);
        let out = link.stop();
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(requests(&out), vec![RadioRequest::Close(collar())]);

        let mut link = streaming_machine();
        let out = link.stop();
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(requests(&out), vec![RadioRequest::Close(collar())]);
        // Stop is not a link loss.
        assert!(events(&out).is_empty());
    }

    #[test]
    fn test_handshake_failures_disconnect_and_retry() {
        let reason = "le-connection-abort-by-local".to_string();
        let stages = [
            (
                LinkState::Connecting,
                RadioEvent::ConnectFailed {
                    id: collar(),
                    reason: reason.clone(),
                },
            ),
            (
                LinkState::Negotiating,
                RadioEvent::ServiceDiscoveryFailed {
                    id: collar(),
                    reason: reason.clone(),
                },
            ),
            (
                LinkState::Subscribing,
                RadioEvent::SubscribeFailed {
                    id: collar(),
                    reason,
                },
            ),
        ];

        for (stage, failure) in stages {
            let mut link = LinkStateMachine::default();
            link.start();
            link.handle(RadioEvent::DeviceDiscovered {
                id: collar(),
                name: Some("DOGFIT-IMU".to_string()),
            });
            if stage != LinkState::Connecting {
                link.handle(RadioEvent::Connected(collar()));
            }
            if stage == LinkState::Subscribing {
                link.handle(RadioEvent::ServicesDiscovered {
                    id: collar(),
                    services: nus_services(),
                });
            }
            assert_eq!(link.state(), stage);

            let out = link.handle(failure);
            assert_eq!(link.state(), LinkState::Idle, "after {}", stage);
            assert_eq!(events(&out), vec![LinkEvent::Disconnected], "after {}", stage);
            let requests = requests(&out);
            assert_eq!(
                requests
                    .iter()
                    .filter(|r| matches!(r, RadioRequest::ScheduleRetry { .. }))
                    .count(),
                1,
                "after {}",
                stage
            );
            assert_eq!(
                requests
                    .iter()
                    .filter(|r| **r == RadioRequest::Close(collar()))
                    .count(),
                1,
                "after {}",
                stage
            );
        }
    }

    #[test]
    fn test_late_failure_after_streaming_is_ignored() {
        let mut link = streaming_machine();
        let out = link.handle(RadioEvent::ConnectFailed {
            id: collar(),
            reason: "stale".to_string(),
        });
        assert!(out.is_empty());
        assert!(link.is_streaming());
    }

    #[test]
    fn test_stop_cancels_pending_retry() {
        let mut link = streaming_machine();
        let out = link.handle(RadioEvent::LinkLost {
            id: collar(),
            reason: "out of range".to_string(),
        });
        let token = retry_token(&out).unwrap();

        let out = link.stop();
        assert_eq!(requests(&out), vec![RadioRequest::CancelRetry(token)]);

        // A timer that fires anyway must not restart the scan.
        let out = link.handle(RadioEvent::RetryElapsed(token));
        assert!(out.is_empty());
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn test_send_command_only_while_streaming() {
        let mut link = LinkStateMachine::default();
        assert!(link.send_command(Command::Start).is_empty());

        let mut link = streaming_machine();
        let out = link.send_command(Command::Start);
        assert_eq!(
            requests(&out),
            vec![RadioRequest::Write {
                id: collar(),
                characteristic: CharRef {
                    service: SERVICE_UUID,
                    characteristic: COMMAND_RX_UUID,
                },
                value: b"START".to_vec(),
            }]
        );
    }

    #[test]
    fn test_adapter_unavailable_does_not_retry() {
        let mut link = LinkStateMachine::default();
        link.start();
        let out = link.handle(RadioEvent::AdapterUnavailable);
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(
            events(&out),
            vec![LinkEvent::Status("Bluetooth disabled".to_string())]
        );
        assert!(link.pending_retry().is_none());
    }

    #[test]
    fn test_stray_connection_is_closed() {
        let mut link = LinkStateMachine::default();
        let out = link.handle(RadioEvent::Connected(collar()));
        assert_eq!(requests(&out), vec![RadioRequest::Close(collar())]);
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut link = LinkStateMachine::new(LinkConfig {
            max_retries: Some(1),
            ..LinkConfig::default()
        });
        link.start();
        let out = link.handle(RadioEvent::DiscoveryFailed("one".to_string()));
        let token = retry_token(&out).unwrap();
        link.handle(RadioEvent::RetryElapsed(token));

        let out = link.handle(RadioEvent::DiscoveryFailed("two".to_string()));
        assert!(retry_token(&out).is_none());
        assert_eq!(
            events(&out),
            vec![LinkEvent::Status("Giving up after 1 attempts".to_string())]
        );

        // An explicit start resets the budget.
        link.start();
        let out = link.handle(RadioEvent::DiscoveryFailed("three".to_string()));
        assert!(retry_token(&out).is_some());
    }
}
