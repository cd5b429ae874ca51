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

//! Durable CSV session files.

use anyhow::Result;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// First line of every session file.
pub const CSV_HEADER: &str = "ts_ms,ax,ay,az,gx,gy,gz";

/// Content type of session files.
pub const CSV_CONTENT_TYPE: &str = "text/csv";

const CSV_EXTENSION: &str = "csv";

/// How many suffixed names to try when a name is already taken.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// A destination to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub file_name: String,
    pub content_type: &'static str,
}

/// Backend that creates append destinations.
pub trait Storage: Send {
    /// Create a new destination. Must fail with `AlreadyExists` rather than
    /// overwrite an existing one.
    fn create(&self, destination: &Destination) -> io::Result<Box<dyn Write + Send>>;
}

/// Session files in one directory.
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Storage for FsStorage {
    fn create(&self, destination: &Destination) -> io::Result<Box<dyn Write + Send>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(&destination.file_name);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        info!("Created {} ({})", path.display(), destination.content_type);
        Ok(Box::new(SyncOnClose(BufWriter::new(file))))
    }
}

/// Buffered file writer that reaches the disk when dropped.
struct SyncOnClose(BufWriter<File>);

impl Write for SyncOnClose {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Drop for SyncOnClose {
    fn drop(&mut self) {
        if let Err(e) = self.0.flush().and_then(|_| self.0.get_ref().sync_all()) {
            warn!("Failed to sync session file: {}", e);
        }
    }
}

struct OpenStream {
    name: String,
    writer: Box<dyn Write + Send>,
}

/// Append-only writer for one session at a time.
pub struct RecordSink {
    storage: Box<dyn Storage>,
    current: Option<OpenStream>,
}

impl RecordSink {
    /// Create an inactive sink.
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage,
            current: None,
        }
    }

    /// Open a new session file and write the header.
    ///
    /// Any open session is closed first. The generated name is returned even
    /// when the file could not be created; the sink then stays inactive.
    pub fn open(&mut self, session_label: &str) -> String {
        self.close();

        let stem = format!("{}_{}", session_label, Local::now().format("%Y%m%d_%H%M%S"));
        let mut file_name = format!("{}.{}", stem, CSV_EXTENSION);

        match self.create(&stem, &mut file_name) {
            Ok(mut writer) => match write_line(writer.as_mut(), CSV_HEADER) {
                Ok(()) => {
                    info!("Logging to {}", file_name);
                    self.current = Some(OpenStream {
                        name: file_name.clone(),
                        writer,
                    });
                }
                Err(e) => error!("Failed to write header to {}: {}", file_name, e),
            },
            Err(e) => error!("Storage unavailable for {}: {}", file_name, e),
        }

        file_name
    }

    fn create(&self, stem: &str, file_name: &mut String) -> Result<Box<dyn Write + Send>> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            if attempt > 0 {
                *file_name = format!("{}-{}.{}", stem, attempt, CSV_EXTENSION);
            }
            let destination = Destination {
                file_name: file_name.clone(),
                content_type: CSV_CONTENT_TYPE,
            };
            match self.storage.create(&destination) {
                Ok(writer) => return Ok(writer),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("{} exists, trying next name", file_name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("no free file name after {} attempts", MAX_NAME_ATTEMPTS)
    }

    /// Append one record and flush it. No-op while inactive.
    pub fn append(&mut self, line: &str) {
        let Some(stream) = self.current.as_mut() else {
            return;
        };
        if let Err(e) = write_line(stream.writer.as_mut(), line) {
            error!("Write to {} failed, closing session: {}", stream.name, e);
            self.current = None;
        }
    }

    /// Flush and release the session file. Safe to call at any time.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.current.take() {
            if let Err(e) = stream.writer.flush() {
                warn!("Flush of {} failed: {}", stream.name, e);
            }
            info!("Closed {}", stream.name);
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Name of the open session file.
    pub fn stream_name(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.name.as_str())
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_line(writer: &mut dyn Write, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
