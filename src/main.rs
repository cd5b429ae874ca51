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

//! Dogfit Logger console application

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dogfit_logger::bluetooth::{BleCentral, LinkEvent};
use dogfit_logger::config::Config;
use dogfit_logger::coordinator::{Coordinator, Presenter};
use dogfit_logger::state::AppState;
use dogfit_logger::storage::{FsStorage, RecordSink};

/// Prints status to the console and mirrors it into [`AppState`].
struct ConsolePresenter {
    state: Arc<AppState>,
}

impl ConsolePresenter {
    fn show(&self, message: &str) {
        self.state.set_last_status(message.to_string());
        println!("{}", self.state.summary(message));
    }
}

impl Presenter for ConsolePresenter {
    fn device_connected(&mut self, name: &str) {
        self.state.set_connected(name.to_string());
        self.show(&format!("Connected to {}", name));
    }

    fn device_disconnected(&mut self) {
        self.state.set_disconnected();
        self.show("Disconnected");
    }

    fn line_received(&mut self, line: &str) {
        let total = self.state.record_line();
        debug!("#{} {}", total, line);
    }

    fn status_message(&mut self, message: &str) {
        self.show(message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dogfit_logger=info")),
        )
        .init();

    info!("Starting Dogfit Logger v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let output_dir = config.output_dir();
    info!("Session files go to {}", output_dir.display());
    let sink = RecordSink::new(Box::new(FsStorage::new(output_dir)));

    let state = AppState::new();

    // Initialize BLE central
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<LinkEvent>(256);
    let (central, link) = BleCentral::new(config.central_config(), event_tx).await?;
    let central_task = tokio::spawn(central.run());

    let presenter = ConsolePresenter {
        state: state.clone(),
    };
    let mut coordinator = Coordinator::new(
        link.clone(),
        sink,
        presenter,
        config.session_settings(),
    );

    link.start().await;
    info!("Ready. Commands: start, stop, status, quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => coordinator.process_event(event),
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "start" => {
                            coordinator.start_session();
                        }
                        "stop" => coordinator.stop_session(),
                        "status" => {
                            let message = state.get_last_status().unwrap_or_default();
                            println!("{} | link: {}", state.summary(&message), link.state());
                        }
                        "quit" | "exit" => {
                            info!("Quit requested");
                            break;
                        }
                        "" => {}
                        other => warn!("Unknown command: {}", other),
                    },
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    link.stop().await;
    coordinator.shutdown();
    drop(coordinator);
    drop(link);
    drop(event_rx);
    if let Err(e) = central_task.await {
        warn!("BLE central task failed: {}", e);
    }

    info!("Dogfit Logger stopped");
    Ok(())
}
