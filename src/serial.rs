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

use std::io::{Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, FlowControl, Parity, StopBits};
use tracing::debug;

/// Read timeout the port is opened with
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Link Trait
// ============================================================================

/// Byte channel used by the transfer session and the receiver emulator
pub trait Link: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Release the underlying device. Safe to call more than once.
    fn close(&mut self);
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "link is closed")
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial port at 8N1 wrapping the serialport crate
pub struct RealSerialPort {
    name: String,
    port: Option<Box<dyn SerialPortTrait>>,
    timeout: Duration,
}

impl RealSerialPort {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open()?;

        debug!(port = port_name, baud_rate, "serial port opened (8N1)");
        Ok(RealSerialPort {
            name: port_name.to_string(),
            port: Some(port),
            timeout: DEFAULT_READ_TIMEOUT,
        })
    }
}

impl Link for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let port = self.port.as_mut().ok_or_else(not_connected)?;
        if timeout != self.timeout {
            port.set_timeout(timeout)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            self.timeout = timeout;
        }
        match port.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.name, "serial port closed");
        }
    }
}

impl Drop for RealSerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Mock Links for Testing
// ============================================================================

#[cfg(test)]
pub use mock::{LoopbackLink, MockLink};
