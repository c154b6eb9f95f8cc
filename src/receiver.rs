// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Emulates the receiving device, for loopback testing without hardware

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::protocol::*;
use crate::serial::Link;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid receiver configuration: {0}")]
    Config(String),

    #[error("no complete image within {0:?}")]
    TimedOut(Duration),

    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitStart,
    Header,
    Data,
    AwaitEnd,
    Complete,
}

/// Byte-driven model of the receiving device.
///
/// The header has no terminator, so it ends at the first read gap
/// (see [`Receiver::idle`]).
#[derive(Debug, Clone)]
pub struct Receiver {
    state: ReceiverState,
    chunk_size: usize,
    header: Vec<u8>,
    expected_len: usize,
    expected_checksum: u8,
    payload: Vec<u8>,
    // Bytes received since the last ACK
    unacked: usize,
}

impl Receiver {
    /// `chunk_size` must be non-zero; [`receive`] rejects zero up front.
    pub fn new(chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be non-zero");
        Receiver {
            state: ReceiverState::AwaitStart,
            chunk_size,
            header: Vec::new(),
            expected_len: 0,
            expected_checksum: 0,
            payload: Vec::new(),
            unacked: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReceiverState::Complete
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume bytes from the link, returning the bytes to send back
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut replies = Vec::new();
        for &byte in bytes {
            self.feed_byte(byte, &mut replies);
        }
        replies
    }

    /// The line went quiet for a read timeout
    pub fn idle(&mut self) -> Vec<u8> {
        if self.state != ReceiverState::Header {
            return Vec::new();
        }

        let header = std::mem::take(&mut self.header);
        match decode_header(&header) {
            Some((length, checksum)) => {
                info!(length, checksum, "header accepted");
                self.expected_len = length;
                self.expected_checksum = checksum;
                self.payload.clear();
                self.unacked = 0;
                self.state = if length == 0 { ReceiverState::AwaitEnd } else { ReceiverState::Data };
                vec![READY]
            }
            None => {
                warn!("malformed header {:02X?}, ignoring", header);
                self.state = ReceiverState::AwaitStart;
                Vec::new()
            }
        }
    }

    fn feed_byte(&mut self, byte: u8, replies: &mut Vec<u8>) {
        match self.state {
            ReceiverState::AwaitStart => {
                if byte == START {
                    self.header.clear();
                    self.header.push(byte);
                    self.state = ReceiverState::Header;
                } else {
                    debug!("discarding {}", control_name(byte));
                }
            }
            ReceiverState::Header => {
                if byte == START {
                    // Sender gave up on us and resent the header
                    self.header.clear();
                }
                self.header.push(byte);
            }
            ReceiverState::Data => {
                if byte == START && self.payload.is_empty() {
                    // Our READY was lost and the sender resent the header
                    debug!("header resent before any data, restarting");
                    self.header.clear();
                    self.header.push(byte);
                    self.state = ReceiverState::Header;
                    return;
                }
                self.payload.push(byte);
                self.unacked += 1;
                let finished = self.payload.len() >= self.expected_len;
                if self.unacked >= self.chunk_size || finished {
                    debug!(received = self.payload.len(), "chunk complete");
                    self.unacked = 0;
                    replies.push(ACK);
                }
                if finished {
                    self.state = ReceiverState::AwaitEnd;
                }
            }
            ReceiverState::AwaitEnd => {
                if byte == END {
                    if self.verify() {
                        self.state = ReceiverState::Complete;
                        replies.push(RECEIVED);
                    }
                } else if byte == START {
                    // A new transfer restarts from the header
                    self.header.clear();
                    self.header.push(byte);
                    self.state = ReceiverState::Header;
                } else {
                    debug!("unexpected {} after payload", control_name(byte));
                }
            }
            ReceiverState::Complete => {
                if byte == END {
                    // Our confirmation was lost; confirm again
                    replies.push(RECEIVED);
                }
            }
        }
    }

    fn verify(&self) -> bool {
        let actual = checksum(&self.payload);
        if self.payload.len() != self.expected_len {
            warn!(received = self.payload.len(), expected = self.expected_len, "length mismatch");
            false
        } else if actual != self.expected_checksum {
            warn!(actual, expected = self.expected_checksum, "checksum mismatch");
            false
        } else {
            info!(bytes = self.payload.len(), checksum = actual, "image verified");
            true
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Act as the receiving device on `link` until one image has been verified,
/// then write it to `output`.
pub fn receive(
    link: &mut dyn Link,
    output: &Path,
    chunk_size: usize,
    read_timeout: Duration,
    overall_timeout: Duration,
) -> Result<usize, ReceiveError> {
    if chunk_size == 0 {
        return Err(ReceiveError::Config("chunk size must be at least 1 byte".into()));
    }
    let mut receiver = Receiver::new(chunk_size);
    let mut buf = [0u8; 4096];
    let start = Instant::now();

    while !receiver.is_complete() {
        if start.elapsed() >= overall_timeout {
            return Err(ReceiveError::TimedOut(overall_timeout));
        }

        let n = link.read(&mut buf, read_timeout)?;
        let replies = if n == 0 {
            receiver.idle()
        } else {
            receiver.feed(&buf[..n])
        };
        if !replies.is_empty() {
            debug!("replying {:02X?}", replies);
            link.write_all(&replies)?;
        }
    }

    std::fs::write(output, receiver.payload()).map_err(|source| ReceiveError::Output {
        path: output.to_path_buf(),
        source,
    })?;
    info!(path = %output.display(), bytes = receiver.payload().len(), "image saved");
    Ok(receiver.payload().len())
}

// ============================================================================
// Tests
// ============================================================================
