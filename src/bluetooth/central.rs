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

//! BLE central backed by BlueZ.
//!
//! [`BleCentral`] runs as one tokio task that owns the [`LinkStateMachine`].
//! Every radio request is spawned as its own task and reports back through a
//! channel, so state transitions are only ever applied by the owning task.

use anyhow::{anyhow, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ble_constants::{config, CLIENT_CONFIG_UUID, ENABLE_NOTIFICATION_VALUE};
use super::link::{
    CharRef, Command, DeviceId, LinkConfig, LinkEvent, LinkState, LinkStateMachine, Output,
    RadioEvent, RadioRequest, RetryToken, ServiceInfo,
};
use crate::coordinator::LinkControl;

/// Settings for the BlueZ central.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    pub link: LinkConfig,
    pub connect_timeout: Duration,
    /// Adapter name such as `hci1`; the default adapter when `None`.
    pub adapter: Option<String>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            connect_timeout: config::CONNECT_TIMEOUT,
            adapter: None,
        }
    }
}

#[derive(Debug)]
enum Control {
    Start,
    Stop,
    Send(Command),
}

/// Cloneable handle to a running [`BleCentral`].
#[derive(Clone)]
pub struct LinkHandle {
    control_tx: mpsc::Sender<Control>,
    state: Arc<RwLock<LinkState>>,
}

impl LinkHandle {
    /// Start scanning for the collar.
    pub async fn start(&self) {
        self.control(Control::Start).await;
    }

    /// Stop scanning or drop the connection.
    pub async fn stop(&self) {
        self.control(Control::Stop).await;
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    async fn control(&self, control: Control) {
        if self.control_tx.send(control).await.is_err() {
            warn!("BLE central is not running");
        }
    }
}

impl LinkControl for LinkHandle {
    fn send_command(&self, command: Command) {
        if let Err(e) = self.control_tx.try_send(Control::Send(command)) {
            warn!("Dropping command {}: {}", command.as_str(), e);
        }
    }

    fn is_streaming(&self) -> bool {
        self.state() == LinkState::Streaming
    }
}

/// Live connection resources for one peripheral.
struct Connection {
    id: DeviceId,
    device: Device,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// BLE central that keeps one collar connected.
pub struct BleCentral {
    adapter: Adapter,
    machine: LinkStateMachine,
    connect_timeout: Duration,
    state: Arc<RwLock<LinkState>>,
    control_rx: mpsc::Receiver<Control>,
    radio_tx: mpsc::Sender<RadioEvent>,
    radio_rx: mpsc::Receiver<RadioEvent>,
    event_tx: mpsc::Sender<LinkEvent>,
    discovery: Option<JoinHandle<()>>,
    connection: Option<Connection>,
    closing: Option<JoinHandle<()>>,
    retries: HashMap<RetryToken, JoinHandle<()>>,
}

impl BleCentral {
    /// Open a BlueZ session and bind to the adapter.
    pub async fn new(
        config: CentralConfig,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Result<(Self, LinkHandle)> {
        info!("Initializing BLE central...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        let (control_tx, control_rx) = mpsc::channel(32);
        let (radio_tx, radio_rx) = mpsc::channel(256);
        let state = Arc::new(RwLock::new(LinkState::Idle));

        let handle = LinkHandle {
            control_tx,
            state: state.clone(),
        };

        let central = Self {
            adapter,
            machine: LinkStateMachine::new(config.link),
            connect_timeout: config.connect_timeout,
            state,
            control_rx,
            radio_tx,
            radio_rx,
            event_tx,
            discovery: None,
            connection: None,
            closing: None,
            retries: HashMap::new(),
        };

        Ok((central, handle))
    }

    /// Process controls and radio callbacks until every handle is dropped.
    pub async fn run(mut self) {
        info!("BLE central running");

        loop {
            let outputs = tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Start) => self.machine.start(),
                    Some(Control::Stop) => self.machine.stop(),
                    Some(Control::Send(command)) => self.machine.send_command(command),
                    None => break,
                },
                Some(event) = self.radio_rx.recv() => {
                    if let RadioEvent::RetryElapsed(token) = &event {
                        self.retries.remove(token);
                    }
                    self.machine.handle(event)
                }
            };
            self.apply(outputs).await;
        }

        info!("All link handles dropped, shutting down BLE central");
        let outputs = self.machine.stop();
        self.apply(outputs).await;
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
        for (_, task) in self.retries.drain() {
            task.abort();
        }
        if let Some(task) = self.closing.take() {
            if let Err(e) = task.await {
                debug!("Disconnect task failed: {}", e);
            }
        }
    }

    async fn apply(&mut self, outputs: Vec<Output>) {
        *self.state.write() = self.machine.state();

        for output in outputs {
            match output {
                Output::Request(request) => self.execute(request),
                Output::Event(event) => {
                    if self.event_tx.send(event).await.is_err() {
                        debug!("Link event receiver dropped");
                    }
                }
            }
        }
    }

    fn execute(&mut self, request: RadioRequest) {
        debug!("Radio request: {:?}", request);

        match request {
            RadioRequest::StartDiscovery => {
                if let Some(task) = self.discovery.take() {
                    task.abort();
                }
                let adapter = self.adapter.clone();
                let tx = self.radio_tx.clone();
                self.discovery = Some(tokio::spawn(async move {
                    if let Err(e) = discover(&adapter, &tx).await {
                        post(&tx, RadioEvent::DiscoveryFailed(e.to_string())).await;
                    }
                }));
            }
            RadioRequest::StopDiscovery => {
                // Dropping the discovery stream ends the BlueZ discovery session.
                if let Some(task) = self.discovery.take() {
                    task.abort();
                }
            }
            RadioRequest::Connect(id) => self.connect(id),
            RadioRequest::DiscoverServices(id) => {
                let tx = self.radio_tx.clone();
                let timeout = self.connect_timeout;
                let Some(conn) = self.connection_for(&id) else {
                    return;
                };
                let device = conn.device.clone();
                conn.tasks.push(tokio::spawn(async move {
                    let event = match resolve_services(&device, timeout).await {
                        Ok(services) => RadioEvent::ServicesDiscovered { id, services },
                        Err(e) => RadioEvent::ServiceDiscoveryFailed {
                            id,
                            reason: e.to_string(),
                        },
                    };
                    post(&tx, event).await;
                }));
            }
            RadioRequest::EnableNotifications { id, characteristic } => {
                let tx = self.radio_tx.clone();
                let Some(conn) = self.connection_for(&id) else {
                    return;
                };
                let device = conn.device.clone();
                conn.tasks.push(tokio::spawn(async move {
                    if let Err(e) = stream_notifications(&device, &id, characteristic, &tx).await {
                        post(
                            &tx,
                            RadioEvent::SubscribeFailed {
                                id,
                                reason: e.to_string(),
                            },
                        )
                        .await;
                    }
                }));
            }
            RadioRequest::Write {
                id,
                characteristic,
                value,
            } => {
                let Some(conn) = self.connection_for(&id) else {
                    return;
                };
                let device = conn.device.clone();
                tokio::spawn(async move {
                    let result = async {
                        let chr = find_characteristic(&device, characteristic).await?;
                        chr.write(&value).await?;
                        Ok::<_, anyhow::Error>(())
                    }
                    .await;
                    match result {
                        Ok(()) => debug!("Wrote {} byte(s) to {}", value.len(), id),
                        Err(e) => warn!("Write to {} failed: {}", id, e),
                    }
                });
            }
            RadioRequest::Close(id) => self.close(id),
            RadioRequest::ScheduleRetry { token, delay } => {
                let tx = self.radio_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&tx, RadioEvent::RetryElapsed(token)).await;
                });
                self.retries.insert(token, task);
            }
            RadioRequest::CancelRetry(token) => {
                if let Some(task) = self.retries.remove(&token) {
                    task.abort();
                }
            }
        }
    }

    fn connect(&mut self, id: DeviceId) {
        let device = match device_for(&self.adapter, &id) {
            Ok(device) => device,
            Err(e) => {
                let tx = self.radio_tx.clone();
                tokio::spawn(async move {
                    post(
                        &tx,
                        RadioEvent::ConnectFailed {
                            id,
                            reason: e.to_string(),
                        },
                    )
                    .await;
                });
                return;
            }
        };

        if let Some(mut previous) = self.connection.take() {
            warn!("Replacing connection to {}", previous.id);
            previous.abort();
        }

        let tx = self.radio_tx.clone();
        let timeout = self.connect_timeout;
        let closing = self.closing.take();
        let task = {
            let device = device.clone();
            let id = id.clone();
            tokio::spawn(after(closing, async move {
                if let Err(e) = connect_and_watch(&device, &id, timeout, &tx).await {
                    let reason = e.to_string();
                    post(&tx, RadioEvent::ConnectFailed { id, reason }).await;
                }
            }))
        };

        self.connection = Some(Connection {
            id,
            device,
            tasks: vec![task],
        });
    }

    fn close(&mut self, id: DeviceId) {
        let device = match self.connection.take() {
            Some(mut conn) if conn.id == id => {
                conn.abort();
                conn.device
            }
            other => {
                self.connection = other;
                match device_for(&self.adapter, &id) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Cannot close {}: {}", id, e);
                        return;
                    }
                }
            }
        };

        let previous = self.closing.take();
        self.closing = Some(tokio::spawn(after(previous, async move {
            match device.disconnect().await {
                Ok(()) => info!("Disconnected from {}", id),
                Err(e) => debug!("Disconnect from {} reported: {}", id, e),
            }
        })));
    }

    fn connection_for(&mut self, id: &DeviceId) -> Option<&mut Connection> {
        match self.connection.as_mut() {
            Some(conn) if &conn.id == id => Some(conn),
            _ => {
                warn!("No connection to {}", id);
                None
            }
        }
    }
}

async fn post(tx: &mpsc::Sender<RadioEvent>, event: RadioEvent) {
    if tx.send(event).await.is_err() {
        debug!("BLE central stopped, dropping radio event");
    }
}

fn device_for(adapter: &Adapter, id: &DeviceId) -> Result<Device> {
    let address: Address = id
        .as_str()
        .parse()
        .map_err(|_| anyhow!("invalid device address {}", id))?;
    Ok(adapter.device(address)?)
}

/// Names already reported per device during one scan.
///
/// BlueZ re-announces a device on every property change (RSSI included), so
/// only a first sighting or a change of name is worth passing on.
#[derive(Debug, Default)]
struct SeenDevices {
    names: HashMap<DeviceId, Option<String>>,
}

impl SeenDevices {
    /// Record a sighting and return whether it should be reported.
    fn observe(&mut self, id: &DeviceId, name: &Option<String>) -> bool {
        match self.names.get(id) {
            Some(known) if known == name => false,
            _ => {
                self.names.insert(id.clone(), name.clone());
                true
            }
        }
    }
}

/// Scan and report every device seen until aborted.
async fn discover(adapter: &Adapter, tx: &mpsc::Sender<RadioEvent>) -> Result<()> {
    if !adapter.is_powered().await? {
        post(tx, RadioEvent::AdapterUnavailable).await;
        return Ok(());
    }

    info!("Scanning on {}", adapter.name());
    // The name often arrives after the device object, in a scan response.
    let events = adapter.discover_devices_with_changes().await?;
    pin_mut!(events);
    let mut seen = SeenDevices::default();

    while let Some(event) = events.next().await {
        if let AdapterEvent::DeviceAdded(address) = event {
            let device = adapter.device(address)?;
            let name = device.name().await.unwrap_or(None);
            let id = DeviceId::new(address.to_string());
            if !seen.observe(&id, &name) {
                continue;
            }
            debug!("Discovered {} ({:?})", address, name);
            post(tx, RadioEvent::DeviceDiscovered { id, name }).await;
        }
    }

    Err(anyhow!("discovery stream ended"))
}

/// Run `next` once `pending` has finished.
async fn after<F>(pending: Option<JoinHandle<()>>, next: F) -> F::Output
where
    F: std::future::Future,
{
    if let Some(pending) = pending {
        if let Err(e) = pending.await {
            debug!("Pending disconnect did not finish: {}", e);
        }
    }
    next.await
}

/// Connect, then report the connection dropping.
///
/// The property stream is opened after any earlier disconnect has completed,
/// so a late `Connected(false)` from that one cannot end this link.
async fn connect_and_watch(
    device: &Device,
    id: &DeviceId,
    timeout: Duration,
    tx: &mpsc::Sender<RadioEvent>,
) -> Result<()> {
    let events = device.events().await?;
    pin_mut!(events);

    info!("Connecting to {}", id);
    let reason = match tokio::time::timeout(timeout, device.connect()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {:?}", timeout)),
    };
    if let Some(reason) = reason {
        post(
            tx,
            RadioEvent::ConnectFailed {
                id: id.clone(),
                reason,
            },
        )
        .await;
        return Ok(());
    }
    post(tx, RadioEvent::Connected(id.clone())).await;

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            post(
                tx,
                RadioEvent::LinkLost {
                    id: id.clone(),
                    reason: "peer disconnected".to_string(),
                },
            )
            .await;
            break;
        }
    }
    Ok(())
}

/// Wait for BlueZ to resolve the remote database, then list it.
async fn resolve_services(device: &Device, timeout: Duration) -> Result<Vec<ServiceInfo>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("services not resolved after {:?}", timeout));
        }
        tokio::time::sleep(config::SERVICES_POLL_INTERVAL).await;
    }

    let mut services = Vec::new();
    for service in device.services().await? {
        let mut characteristics = Vec::new();
        for chr in service.characteristics().await? {
            characteristics.push(chr.uuid().await?);
        }
        let uuid = service.uuid().await?;
        debug!("Service {} with {} characteristic(s)", uuid, characteristics.len());
        services.push(ServiceInfo {
            uuid,
            characteristics,
        });
    }
    Ok(services)
}

async fn find_characteristic(device: &Device, target: CharRef) -> Result<Characteristic> {
    for service in device.services().await? {
        if service.uuid().await? != target.service {
            continue;
        }
        for chr in service.characteristics().await? {
            if chr.uuid().await? == target.characteristic {
                return Ok(chr);
            }
        }
    }
    Err(anyhow!("characteristic {} not found", target.characteristic))
}

/// Subscribe, then forward notification payloads until the stream ends.
async fn stream_notifications(
    device: &Device,
    id: &DeviceId,
    target: CharRef,
    tx: &mpsc::Sender<RadioEvent>,
) -> Result<()> {
    let chr = find_characteristic(device, target).await?;
    // BlueZ writes the CCCD itself as part of StartNotify.
    debug!(
        "Enabling notifications on {} (descriptor {} <- {:02x?})",
        target.characteristic, CLIENT_CONFIG_UUID, ENABLE_NOTIFICATION_VALUE
    );
    let notifications = chr.notify().await?;
    pin_mut!(notifications);
    post(tx, RadioEvent::NotificationsEnabled(id.clone())).await;

    while let Some(value) = notifications.next().await {
        post(
            tx,
            RadioEvent::Notification {
                id: id.clone(),
                value,
            },
        )
        .await;
    }

    warn!("Notification stream from {} ended", id);
    post(
        tx,
        RadioEvent::LinkLost {
            id: id.clone(),
            reason: "notification stream ended".to_string(),
        },
    )
    .await;
    Ok(())
}
