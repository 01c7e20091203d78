// src/lib.rs
//
// scanlink - host-side gateway between an application and a CAN bus reached
// through a Scanmatic 2 Pro USB/serial adapter.
//
// Layering, bottom up:
//   link/    - byte-oriented duplex channel (serial port or USB bulk endpoints)
//   codec    - Scanmatic envelope assembly/disassembly with resynchronisation
//   session  - connection lifecycle, validation, filtering, statistics, events
//   diag/    - UDS (ISO 14229) and OBD-II (SAE J1979) request/response engines
//   gateway  - thin facade bundling a session with its diagnostic engines

pub mod codec;
mod error;
pub mod gateway;
pub mod link;
pub mod session;

pub mod diag;

pub use diag::dtc::{Dtc, DtcCategory};
pub use diag::obd2::{Obd2Client, PidValue};
pub use diag::uds::{Nrc, UdsClient};
pub use diag::DiagEvent;
pub use error::{Error, ErrorKind, Result};
pub use gateway::Gateway;
pub use link::{ByteLink, LinkProfile, SerialLinkConfig, UsbLinkConfig};
pub use session::{CanSession, ConnectionState, FilterAction, SessionEvent, Statistics};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Highest valid 29-bit (extended) CAN identifier.
pub const CAN_ID_MAX: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame.
pub const CAN_PAYLOAD_MAX: usize = 8;

/// Direction of a CAN frame relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// A single CAN frame as seen by the session layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// 11-bit standard or 29-bit extended identifier.
    pub can_id: u32,
    /// Frame data, up to 8 bytes.
    pub payload: Vec<u8>,
    /// Host UNIX timestamp in microseconds, captured when the complete
    /// envelope was extracted from the byte stream.
    pub timestamp_us: u64,
    pub direction: Direction,
}

impl CanFrame {
    pub fn received(can_id: u32, payload: Vec<u8>) -> Self {
        Self {
            can_id,
            payload,
            timestamp_us: now_us(),
            direction: Direction::Rx,
        }
    }
}

/// Get current time in microseconds since UNIX epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Human-readable one-line rendering of a frame, e.g. `ID=0x7E8, Data=41 0D`.
pub fn format_can_message(can_id: u32, payload: &[u8]) -> String {
    let data: Vec<String> = payload.iter().map(|b| format!("{:02X}", b)).collect();
    format!("ID=0x{:X}, Data={}", can_id, data.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_can_message() {
        assert_eq!(
            format_can_message(0x7E8, &[0x41, 0x0D]),
            "ID=0x7E8, Data=41 0D"
        );
        assert_eq!(format_can_message(0x123, &[]), "ID=0x123, Data=");
    }
}
