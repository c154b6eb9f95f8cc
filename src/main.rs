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

// UART image link: sends 2bpp images to an embedded receiver
mod chunk;
mod payload;
mod protocol;
mod receiver;
mod serial;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use payload::PayloadFormat;
use serial::{Link, RealSerialPort};
use session::SessionConfig;

#[derive(Parser)]
#[command(name = "imglink")]
#[command(about = "Send 2bpp images to an embedded receiver over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM3)
    #[arg(short, long)]
    port: String,

    /// Baud rate (the receiver firmware uses 115200 or 500000)
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// How long a single read waits for the peer
    #[arg(long, default_value = "1000", value_name = "MS")]
    read_timeout_ms: u64,

    /// Enable debug output
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Only report errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send an image payload to the receiver
    Send {
        /// Payload file (.b64.txt or packed .bin)
        file: PathBuf,

        /// How to read the payload file
        #[arg(long, value_enum, default_value_t = PayloadFormat::Auto)]
        format: PayloadFormat,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "30", value_name = "SECS")]
        timeout: u64,

        /// Bytes written between acknowledgments
        #[arg(long, default_value_t = protocol::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Unanswered reads before resending
        #[arg(long, default_value_t = protocol::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        /// Pause after each resend
        #[arg(long, default_value = "100", value_name = "MS")]
        backoff_ms: u64,
    },
    /// Act as the receiver and save one image (loopback testing)
    Receive {
        /// Where to write the received payload
        #[arg(short, long)]
        output: PathBuf,

        /// Bytes expected between acknowledgments
        #[arg(long, default_value_t = protocol::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "60", value_name = "SECS")]
        timeout: u64,
    },
}

fn init_tracing(debug: bool, quiet: bool) {
    let level = if debug {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("imglink={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let read_timeout = Duration::from_millis(cli.read_timeout_ms);

    info!("Opening serial port: {} at {} baud (8N1)", cli.port, cli.baud);
    let mut port = RealSerialPort::open(&cli.port, cli.baud)
        .with_context(|| format!("failed to open serial port {}", cli.port))?;

    match cli.command {
        Commands::Send { file, format, timeout, chunk_size, max_attempts, backoff_ms } => {
            let config = SessionConfig {
                chunk_size,
                max_attempts,
                read_timeout,
                backoff: Duration::from_millis(backoff_ms),
                overall_timeout: Duration::from_secs(timeout),
            };

            info!("Sending image: {}", file.display());
            let report = session::send(Box::new(port), &file, format, config)
                .context("image transfer failed")?;
            info!(
                "Image sent: {} bytes in {} chunks, {} resends, {:.2} s",
                report.bytes,
                report.chunks,
                report.resends,
                report.elapsed.as_secs_f64()
            );
        }
        Commands::Receive { output, chunk_size, timeout } => {
            info!("Waiting for an image, saving to {}", output.display());
            let result = receiver::receive(
                &mut port,
                &output,
                chunk_size,
                read_timeout,
                Duration::from_secs(timeout),
            );
            port.close();
            let bytes = result.context("receive failed")?;
            info!("Image received: {} bytes", bytes);
        }
    }

    Ok(())
}
