// src/error.rs
//
// Error taxonomy for the gateway. Every variant carries display text suitable
// for a log view; `kind()` gives the machine-readable class for programmatic
// handling, and `is_fatal()` drives the session's auto-disconnect policy.

use serde::Serialize;
use thiserror::Error;

use crate::diag::uds::Nrc;

/// Machine-readable error class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Invalid configuration or request parameters.
    Config,
    /// Link open/read/write failure.
    Link,
    /// Invalid envelope or reassembly-buffer overflow; always non-fatal.
    Framing,
    /// Unexpected service id, negative response, or malformed PDU.
    Protocol,
    /// Per-request deadline exceeded.
    Timeout,
    /// Operation not permitted in the current state.
    State,
    /// The underlying device is gone; the session tears down.
    ResourceLost,
}

#[derive(Debug, Error)]
pub enum Error {
    // Config
    #[error("invalid port name: {0}")]
    InvalidPort(String),
    #[error("invalid CAN ID 0x{0:X} (maximum 29 bits)")]
    CanIdOutOfRange(u32),
    #[error("CAN payload too long: {0} bytes (max 8)")]
    FrameTooLong(usize),

    // Link
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("port busy: {0}")]
    PortBusy(String),
    #[error("{context}: {source}")]
    LinkIo {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write timed out: {0}")]
    WriteTimeout(String),

    // Framing
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("receive buffer overflow ({size} bytes), buffer cleared")]
    BufferOverflow { size: usize },

    // Protocol
    #[error("unexpected service id: expected 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedService { expected: u8, got: u8 },
    #[error("negative response for service 0x{service:02X}: {nrc}")]
    Negative { service: u8, nrc: Nrc },
    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    // Timeout
    #[error("timed out waiting for response")]
    Timeout,

    // State
    #[error("adapter is not connected")]
    NotConnected,
    #[error("a request is already in flight")]
    Busy,

    // Resource lost
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPort(_) | Error::CanIdOutOfRange(_) | Error::FrameTooLong(_) => {
                ErrorKind::Config
            }
            Error::DeviceNotFound(_)
            | Error::PermissionDenied(_)
            | Error::PortBusy(_)
            | Error::LinkIo { .. }
            | Error::WriteTimeout(_) => ErrorKind::Link,
            Error::InvalidEnvelope(_) | Error::BufferOverflow { .. } => ErrorKind::Framing,
            Error::UnexpectedService { .. } | Error::Negative { .. } | Error::MalformedPdu(_) => {
                ErrorKind::Protocol
            }
            Error::Timeout => ErrorKind::Timeout,
            Error::NotConnected | Error::Busy => ErrorKind::State,
            Error::ConnectionLost(_) => ErrorKind::ResourceLost,
        }
    }

    /// Fatal errors also change connection status.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::ResourceLost
    }

    /// Map a serial-port open failure to the link taxonomy.
    pub(crate) fn from_serial_open(port: &str, err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Error::DeviceNotFound(port.to_string()),
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                Error::PermissionDenied(port.to_string())
            }
            _ => Error::PortBusy(format!("{}: {}", port, err)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::FrameTooLong(9).kind(), ErrorKind::Config);
        assert_eq!(Error::NotConnected.kind(), ErrorKind::State);
        assert_eq!(Error::Busy.kind(), ErrorKind::State);
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            Error::BufferOverflow { size: 4096 }.kind(),
            ErrorKind::Framing
        );
        assert_eq!(
            Error::ConnectionLost("gone".into()).kind(),
            ErrorKind::ResourceLost
        );
    }

    #[test]
    fn test_only_resource_loss_is_fatal() {
        assert!(Error::ConnectionLost("unplugged".into()).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::BufferOverflow { size: 1 }.is_fatal());
    }
}
