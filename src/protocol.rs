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

//! Image link protocol constants and header framing

/// Start of heading - sender announces an image, followed by "<length>,<checksum>"
pub const START: u8 = 0x01;

/// End of text - sender signals that the whole image has been written
pub const END: u8 = 0x03;

/// Acknowledge - receiver is ready for data, or has accepted a chunk
pub const READY: u8 = 0x06;

/// Same byte as READY; which one is meant depends on the sender's state
pub const ACK: u8 = READY;

/// Synchronous idle - receiver confirms the complete image arrived intact
pub const RECEIVED: u8 = 0x16;

/// Separates the decimal length from the decimal checksum in the header
pub const HEADER_SEPARATOR: u8 = b',';

/// Bytes written between two acknowledgments
pub const DEFAULT_CHUNK_SIZE: usize = 10240;

/// Consecutive unanswered reads tolerated before a state escalates
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Sum of every byte, modulo 256.
///
/// This is only a transmission sanity check. It has no collision resistance
/// and does not detect reordered bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build the header frame: START, the decimal payload length, a comma and the
/// decimal checksum. There is no terminator byte.
pub fn encode_header(length: usize, checksum: u8) -> Vec<u8> {
    let mut frame = vec![START];
    frame.extend_from_slice(length.to_string().as_bytes());
    frame.push(HEADER_SEPARATOR);
    frame.extend_from_slice(checksum.to_string().as_bytes());
    frame
}

/// Parse a header frame back into `(length, checksum)`.
///
/// Returns `None` unless the frame is exactly START followed by two decimal
/// fields separated by a single comma.
pub fn decode_header(frame: &[u8]) -> Option<(usize, u8)> {
    let (&first, rest) = frame.split_first()?;
    if first != START {
        return None;
    }
    let text = std::str::from_utf8(rest).ok()?;
    let (length, checksum) = text.split_once(HEADER_SEPARATOR as char)?;
    if !is_decimal(length) || !is_decimal(checksum) {
        return None;
    }
    Some((length.parse().ok()?, checksum.parse().ok()?))
}

fn is_decimal(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit())
}

/// Printable name of a control byte for log output
pub fn control_name(byte: u8) -> String {
    match byte {
        START => "START".into(),
        END => "END".into(),
        READY => "READY/ACK".into(),
        RECEIVED => "RECEIVED".into(),
        other => format!("0x{:02X}", other),
    }
}
