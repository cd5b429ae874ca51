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

//! Line framing for the telemetry notification stream.

use tracing::{debug, warn};

const LINE_TERMINATOR: u8 = b'\n';

/// Turns arbitrarily split notification payloads into complete text lines.
///
/// Bytes are buffered until a `\n` arrives. Each terminated line is decoded
/// as UTF-8 (invalid sequences are replaced), trimmed, and returned unless it
/// is blank. The trailing partial fragment stays buffered for the next call.
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create a new frame assembler.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
        }
    }

    /// Feed one notification payload.
    ///
    /// Returns every line completed by this payload, in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut consumed = 0;

        while let Some(pos) = self.buffer[consumed..]
            .iter()
            .position(|&b| b == LINE_TERMINATOR)
        {
            let end = consumed + pos;
            let raw = &self.buffer[consumed..end];
            let text = String::from_utf8_lossy(raw);
            if matches!(text, std::borrow::Cow::Owned(_)) {
                warn!("Replaced malformed UTF-8 in {} byte line", raw.len());
            }

            let line = text.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            consumed = end + 1;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        if !lines.is_empty() {
            debug!(
                "Framed {} line(s), {} byte(s) pending",
                lines.len(),
                self.buffer.len()
            );
        }

        lines
    }

    /// Discard any partial fragment.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Dropping {} byte partial line", self.buffer.len());
        }
        self.buffer.clear();
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
