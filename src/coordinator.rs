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

//! Link event processing and session control.

use tracing::{debug, info};

use crate::bluetooth::{Command, LinkEvent};
use crate::storage::RecordSink;

/// The parts of the link the coordinator drives.
pub trait LinkControl {
    /// Fire-and-forget command write; ignored unless streaming.
    fn send_command(&self, command: Command);

    fn is_streaming(&self) -> bool;
}

/// Presentation layer notifications.
pub trait Presenter {
    fn device_connected(&mut self, name: &str);
    fn device_disconnected(&mut self);
    fn line_received(&mut self, line: &str);
    fn status_message(&mut self, message: &str);
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Prefix of session file names.
    pub label: String,
    /// Emit a progress status every this many received lines (0 disables).
    pub status_every: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            label: "imu".to_string(),
            status_every: 10,
        }
    }
}

/// Routes link events to the sink and the presentation layer.
pub struct Coordinator<L, P> {
    link: L,
    sink: RecordSink,
    presenter: P,
    settings: SessionSettings,
    lines_received: u64,
    lines_written: u64,
}

impl<L: LinkControl, P: Presenter> Coordinator<L, P> {
    /// Create a new coordinator.
    pub fn new(link: L, sink: RecordSink, presenter: P, settings: SessionSettings) -> Self {
        Self {
            link,
            sink,
            presenter,
            settings,
            lines_received: 0,
            lines_written: 0,
        }
    }

    /// Process a single link event.
    pub fn process_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { device_name } => {
                info!("Device connected: {}", device_name);
                self.presenter.device_connected(&device_name);
            }
            LinkEvent::Disconnected => {
                info!("Device disconnected");
                self.presenter.device_disconnected();
            }
            LinkEvent::LineReceived(line) => self.handle_line(&line),
            LinkEvent::Status(message) => self.presenter.status_message(&message),
        }
    }

    fn handle_line(&mut self, line: &str) {
        debug!("Line: {}", line);
        if self.sink.is_active() {
            self.sink.append(line);
            if self.sink.is_active() {
                self.lines_written += 1;
            }
        }
        self.lines_received += 1;
        self.presenter.line_received(line);

        let every = self.settings.status_every;
        if every > 0 && self.lines_received % every == 0 {
            self.presenter.status_message("Receiving data");
        }
    }

    /// Ask the collar to start streaming and open a new session file.
    ///
    /// Returns the session file name.
    pub fn start_session(&mut self) -> String {
        if !self.link.is_streaming() {
            debug!("Starting session while not streaming");
        }
        self.link.send_command(Command::Start);

        let name = self.sink.open(&self.settings.label);
        self.presenter.status_message(&format!("Logging to {}", name));
        name
    }

    /// Ask the collar to stop streaming and close the session file.
    pub fn stop_session(&mut self) {
        self.link.send_command(Command::Stop);
        self.sink.close();
        self.presenter.status_message("Logging stopped");
    }

    /// Close the session file without commanding the collar.
    pub fn shutdown(&mut self) {
        self.sink.close();
    }

    pub fn is_logging(&self) -> bool {
        self.sink.is_active()
    }

    /// Lines received since start, logged or not.
    pub fn lines_received(&self) -> u64 {
        self.lines_received
    }

    /// Lines appended to session files.
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }
}
