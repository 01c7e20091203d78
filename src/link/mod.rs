// src/link/mod.rs
//
// L0 byte-channel abstraction over the Scanmatic 2 Pro adapter.
//
// A link owns the OS handle (serial port or USB device) and runs one I/O
// loop: it drains queued transmit requests between reads and forwards
// received bytes upward as LinkMessage::Bytes. The handle itself is never
// exposed above this layer.

pub mod serial;
pub mod usb;

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::mpsc as std_mpsc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

// ============================================================================
// Bitrate Mapping
// ============================================================================

/// CAN bitrate (kbit/s) to serial baud rate and adapter speed-code mapping.
const BITRATE_TABLE: [(u32, u32, u8); 4] = [
    (125, 57_600, 0x00),
    (250, 115_200, 0x01),
    (500, 230_400, 0x02),
    (1000, 460_800, 0x03),
];

/// Look up the serial baud rate for a CAN bitrate.
pub fn serial_baud_for_bitrate(bitrate_kbps: u32) -> Result<u32> {
    BITRATE_TABLE
        .iter()
        .find(|(rate, _, _)| *rate == bitrate_kbps)
        .map(|(_, baud, _)| *baud)
        .ok_or_else(|| invalid_bitrate(bitrate_kbps))
}

/// Look up the adapter init speed code for a CAN bitrate.
pub fn speed_code_for_bitrate(bitrate_kbps: u32) -> Result<u8> {
    BITRATE_TABLE
        .iter()
        .find(|(rate, _, _)| *rate == bitrate_kbps)
        .map(|(_, _, code)| *code)
        .ok_or_else(|| invalid_bitrate(bitrate_kbps))
}

fn invalid_bitrate(bitrate_kbps: u32) -> Error {
    let valid: Vec<String> = BITRATE_TABLE.iter().map(|(r, _, _)| r.to_string()).collect();
    Error::InvalidPort(format!(
        "unsupported CAN bitrate {} kbit/s (valid: {})",
        bitrate_kbps,
        valid.join(", ")
    ))
}

/// Extract the bare port name from a display string.
///
/// Port pickers hand back strings like `"ttyUSB0 (FTDI Serial Converter)"` or
/// `"COM3 - USB Serial Port"`; the device name is the token before the first
/// space.
pub fn parse_port_name(display_name: &str) -> Result<String> {
    let trimmed = display_name.trim();
    let name = match trimmed.find(' ') {
        Some(i) => &trimmed[..i],
        None => trimmed,
    };
    if name.is_empty() {
        return Err(Error::InvalidPort(display_name.to_string()));
    }
    Ok(name.to_string())
}

// ============================================================================
// Configuration
// ============================================================================

fn default_read_timeout_ms() -> u64 {
    50
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_max_buffer_bytes() -> usize {
    4096
}
fn default_vendor_id() -> u16 {
    0x20A2
}
fn default_product_id() -> u16 {
    0x0001
}

/// Serial link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialLinkConfig {
    /// Serial port path or display string (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// CAN bus bitrate in kbit/s (125, 250, 500 or 1000).
    pub bitrate_kbps: u32,
    /// Per-read timeout for the receive loop.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long a queued write may take before the caller gives up.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Reassembly buffer cap (minimum 1024).
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

/// USB bulk link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsbLinkConfig {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    /// CAN bus bitrate in kbit/s (125, 250, 500 or 1000).
    pub bitrate_kbps: u32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

/// Which transport to use for a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkProfile {
    Serial(SerialLinkConfig),
    Usb(UsbLinkConfig),
}

impl LinkProfile {
    pub fn write_timeout_ms(&self) -> u64 {
        match self {
            LinkProfile::Serial(c) => c.write_timeout_ms,
            LinkProfile::Usb(c) => c.write_timeout_ms,
        }
    }

    pub fn max_buffer_bytes(&self) -> usize {
        match self {
            LinkProfile::Serial(c) => c.max_buffer_bytes,
            LinkProfile::Usb(c) => c.max_buffer_bytes,
        }
    }
}

// ============================================================================
// Link Contract
// ============================================================================

/// Message from a link's I/O loop to the session dispatch task.
#[derive(Debug)]
pub enum LinkMessage {
    /// Raw bytes received from the adapter.
    Bytes(Vec<u8>),
    /// Recoverable I/O problem; counted, the loop continues.
    Error(String),
    /// The device is gone. The session must auto-disconnect.
    Lost(String),
    /// The loop finished (stop requested or after a loss).
    Ended(String),
}

/// A queued write with a per-request result channel.
pub struct TransmitRequest {
    /// Encoded envelope bytes ready to send.
    pub data: Vec<u8>,
    /// Completion signal for the caller awaiting the write.
    pub result_tx: oneshot::Sender<std::result::Result<(), String>>,
}

/// Sender half of the transmit queue (bounded, drained by the I/O loop).
pub type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;

/// Capacity of the transmit queue between the session and the I/O loop.
pub(crate) const TRANSMIT_QUEUE_DEPTH: usize = 32;

/// A bidirectional byte channel to the adapter.
///
/// `start` opens the device, runs the adapter init handshake and spawns the
/// I/O loop; open or handshake failures are returned directly and nothing is
/// left running. Received bytes, errors and loop termination arrive on the
/// `events` channel; writes go through the returned `TransmitSender`.
#[async_trait]
pub trait ByteLink: Send {
    async fn start(&mut self, events: mpsc::Sender<LinkMessage>) -> Result<TransmitSender>;

    /// Stop the I/O loop and release the device. Idempotent.
    async fn stop(&mut self);

    /// Human-readable target for log and error text.
    fn descriptor(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_baud_mapping() {
        assert_eq!(serial_baud_for_bitrate(125).unwrap(), 57_600);
        assert_eq!(serial_baud_for_bitrate(250).unwrap(), 115_200);
        assert_eq!(serial_baud_for_bitrate(500).unwrap(), 230_400);
        assert_eq!(serial_baud_for_bitrate(1000).unwrap(), 460_800);
        assert!(serial_baud_for_bitrate(800).is_err());
    }

    #[test]
    fn test_bitrate_speed_codes() {
        assert_eq!(speed_code_for_bitrate(125).unwrap(), 0x00);
        assert_eq!(speed_code_for_bitrate(250).unwrap(), 0x01);
        assert_eq!(speed_code_for_bitrate(500).unwrap(), 0x02);
        assert_eq!(speed_code_for_bitrate(1000).unwrap(), 0x03);
        assert!(speed_code_for_bitrate(0).is_err());
    }

    #[test]
    fn test_parse_port_name() {
        assert_eq!(
            parse_port_name("ttyUSB0 (FTDI Serial Converter)").unwrap(),
            "ttyUSB0"
        );
        assert_eq!(parse_port_name("COM3 - USB Serial Port").unwrap(), "COM3");
        assert_eq!(parse_port_name("/dev/ttyACM0").unwrap(), "/dev/ttyACM0");
        assert!(parse_port_name("   ").is_err());
    }
}
