// src/diag/mod.rs
//
// Shared machinery for the request/response diagnostic engines.
//
// Each engine serialises its traffic: one request in flight, matched against
// replies arriving on the session's event bus. A request is sent on
// `request_id` and answered from a window of reply addresses starting at
// `response_id` (OBD-II ECUs answer from 0x7E8..0x7EB); exact-match mode
// narrows the window to a single ID for UDS point-to-point links.

pub mod dtc;
pub mod obd2;
pub mod uds;

use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::session::{CanSession, SessionEvent};
use dtc::Dtc;
use uds::Nrc;

/// How many timeout intervals a request may be kept alive by NRC 0x78
/// (ResponsePending) rearms, measured from the original send.
const RESPONSE_PENDING_MAX_FACTOR: u32 = 5;

/// Addressing and timing for one diagnostic engine.
#[derive(Clone, Debug)]
pub struct DiagConfig {
    /// CAN ID requests are sent on (0x7DF functional broadcast by default).
    pub request_id: u32,
    /// First CAN ID replies are accepted from.
    pub response_id: u32,
    /// Restrict replies to exactly `response_id` instead of a 4-ID window.
    pub exact_response_match: bool,
    /// Per-request deadline.
    pub timeout: Duration,
}

impl DiagConfig {
    fn accepts_reply_from(&self, can_id: u32) -> bool {
        if self.exact_response_match {
            can_id == self.response_id
        } else {
            (self.response_id..=self.response_id + 3).contains(&can_id)
        }
    }
}

/// Events emitted by a diagnostic engine.
#[derive(Clone, Debug, Serialize)]
pub enum DiagEvent {
    /// Raw PDU of a positive response.
    Response(Vec<u8>),
    /// The per-request deadline elapsed.
    Timeout,
    /// Result of a DTC read.
    DtcList(Vec<Dtc>),
    /// Security access unlocked at this level.
    SecurityAccessGranted(u8),
    /// The ECU refused a security access step.
    SecurityAccessDenied { level: u8, nrc: Nrc },
}

/// Common state of both engines: the session handle, addressing, the
/// exclusive in-flight slot, and the engine event bus.
pub(crate) struct DiagCore {
    session: CanSession,
    config: Mutex<DiagConfig>,
    inflight: tokio::sync::Mutex<()>,
    events: broadcast::Sender<DiagEvent>,
}

impl DiagCore {
    pub(crate) fn new(session: CanSession, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session,
            config: Mutex::new(DiagConfig {
                request_id: 0x7DF,
                response_id: 0x7E8,
                exact_response_match: false,
                timeout,
            }),
            inflight: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DiagEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DiagEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_request_id(&self, can_id: u32) {
        self.config.lock().unwrap().request_id = can_id;
    }

    pub(crate) fn set_response_id(&self, can_id: u32) {
        self.config.lock().unwrap().response_id = can_id;
    }

    pub(crate) fn set_exact_response_match(&self, exact: bool) {
        self.config.lock().unwrap().exact_response_match = exact;
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.config.lock().unwrap().timeout = timeout;
    }

    pub(crate) fn config(&self) -> DiagConfig {
        self.config.lock().unwrap().clone()
    }

    /// Send a request PDU without waiting for any reply (TesterPresent).
    pub(crate) async fn send_only(&self, request: &[u8]) -> Result<()> {
        let request_id = self.config().request_id;
        self.session.send(request_id, request).await
    }

    /// Send a request PDU and wait for the matching response.
    ///
    /// `expected_echo` is the second response byte some services echo back
    /// (the PID for OBD-II data requests, the sub-function for others);
    /// responses failing the echo check are ignored, not errors.
    ///
    /// Fails `Busy` immediately if a request is already in flight.
    pub(crate) async fn execute(
        &self,
        request: &[u8],
        expected_echo: Option<u8>,
    ) -> Result<Vec<u8>> {
        let _guard = self.inflight.try_lock().map_err(|_| Error::Busy)?;
        let config = self.config();
        let service = request[0];

        match run_request(&self.session, &config, request, service, expected_echo).await {
            Ok(payload) => {
                self.emit(DiagEvent::Response(payload.clone()));
                Ok(payload)
            }
            Err(Error::Timeout) => {
                self.emit(DiagEvent::Timeout);
                Err(Error::Timeout)
            }
            Err(e) => Err(e),
        }
    }
}

/// One request/response exchange against the session.
async fn run_request(
    session: &CanSession,
    config: &DiagConfig,
    request: &[u8],
    service: u8,
    expected_echo: Option<u8>,
) -> Result<Vec<u8>> {
    // Subscribe before sending so the reply cannot slip past.
    let mut events = session.subscribe();
    session.send(config.request_id, request).await?;

    let started = Instant::now();
    let mut deadline = started + config.timeout;
    let hard_deadline = started + config.timeout * RESPONSE_PENDING_MAX_FACTOR;

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(Error::ConnectionLost("session closed".to_string()));
            }
            Err(_) => return Err(Error::Timeout),
        };

        match event {
            SessionEvent::FrameReceived(frame) => {
                if !config.accepts_reply_from(frame.can_id) {
                    continue;
                }
                let payload = frame.payload;
                if payload.is_empty() {
                    continue;
                }

                if payload[0] == 0x7F {
                    // Negative response: 7F <echoed sid> <nrc>.
                    if payload.len() < 3 || payload[1] != service {
                        continue;
                    }
                    let nrc = Nrc::from_code(payload[2]);
                    if nrc == Nrc::ResponsePending {
                        // The ECU asked for more time; rearm the deadline,
                        // bounded by the hard cap.
                        deadline = (Instant::now() + config.timeout).min(hard_deadline);
                        debug!(
                            "[diag] 0x{:02X}: response pending, deadline extended",
                            service
                        );
                        continue;
                    }
                    return Err(Error::Negative { service, nrc });
                }

                if payload[0] == service | 0x40 {
                    if let Some(echo) = expected_echo {
                        if payload.len() < 2 || payload[1] != echo {
                            continue;
                        }
                    }
                    return Ok(payload);
                }

                // A reply to somebody else's exchange on the same window.
                continue;
            }
            SessionEvent::ConnectionStatusChanged(false) => {
                return Err(Error::ConnectionLost(
                    "disconnected while waiting for response".to_string(),
                ));
            }
            _ => continue,
        }
    }
}
