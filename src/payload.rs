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

//! Loads an encoded image payload and wraps it in a transfer request

use std::path::{Path, PathBuf};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{info, warn};
use crate::protocol::checksum;

/// Picture geometry the receiver expects
pub const IMAGE_WIDTH: usize = 240;
pub const IMAGE_HEIGHT: usize = 128;

/// Four 2-bit pixels per byte
pub const PACKED_LEN: usize = IMAGE_WIDTH * IMAGE_HEIGHT / 4;

/// Base64 text of the packed image
pub const BASE64_LEN: usize = PACKED_LEN.div_ceil(3) * 4;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to read payload {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PayloadFormat {
    /// Text for a .txt extension, binary otherwise
    #[default]
    Auto,
    /// Base64 text, surrounding whitespace stripped
    Text,
    /// Packed 2bpp bytes, sent verbatim
    Binary,
}

impl PayloadFormat {
    /// Resolve `Auto` against the file name
    pub fn resolve(self, path: &Path) -> PayloadFormat {
        match self {
            PayloadFormat::Auto => {
                let is_text = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("txt"));
                if is_text { PayloadFormat::Text } else { PayloadFormat::Binary }
            }
            other => other,
        }
    }

    /// Length a well-formed payload of this format has
    pub fn expected_len(self) -> usize {
        match self {
            PayloadFormat::Binary => PACKED_LEN,
            PayloadFormat::Text | PayloadFormat::Auto => BASE64_LEN,
        }
    }
}

/// What the session sends: the payload, the length its format calls for and
/// the checksum announced in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub payload: Vec<u8>,
    pub declared_length: usize,
    pub checksum: u8,
}

impl TransferRequest {
    /// Computes the checksum once. A length mismatch is only reported; the
    /// payload is still sent in full with its real length.
    pub fn new(payload: Vec<u8>, declared_length: usize) -> Self {
        if payload.len() != declared_length {
            warn!(
                actual = payload.len(),
                expected = declared_length,
                "payload length differs from the expected image size, sending anyway"
            );
        }
        let checksum = checksum(&payload);
        TransferRequest { payload, declared_length, checksum }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[cfg(test)]
    pub fn length_matches(&self) -> bool {
        self.payload.len() == self.declared_length
    }
}

/// Read a payload file in the given format
pub fn load(path: &Path, format: PayloadFormat) -> Result<TransferRequest, PayloadError> {
    let format = format.resolve(path);
    let read_error = |source| PayloadError::Read { path: path.to_path_buf(), source };

    let payload = match format {
        PayloadFormat::Text => {
            let text = std::fs::read_to_string(path).map_err(read_error)?;
            let text = text.trim();
            check_base64(text);
            text.as_bytes().to_vec()
        }
        _ => std::fs::read(path).map_err(read_error)?,
    };

    info!(path = %path.display(), ?format, bytes = payload.len(), "payload loaded");
    Ok(TransferRequest::new(payload, format.expected_len()))
}

// Advisory only: the receiver decodes, we just send characters.
fn check_base64(text: &str) {
    match STANDARD.decode(text) {
        Ok(decoded) if decoded.len() != PACKED_LEN => {
            warn!(decoded = decoded.len(), expected = PACKED_LEN, "base64 payload decodes to an unexpected size");
        }
        Ok(_) => {}
        Err(e) => warn!("payload is not valid base64: {}", e),
    }
}
