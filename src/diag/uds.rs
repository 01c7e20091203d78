// src/diag/uds.rs
//
// UDS (ISO 14229) engine.
//
// Requests occupy the CAN payload directly (no ISO-TP segmentation), so each
// service plus its data must fit in one frame. Positive responses carry
// `sid | 0x40`; negative responses are `7F <sid> <nrc>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::sync::broadcast;

use super::dtc::Dtc;
use super::{DiagCore, DiagEvent};
use crate::error::{Error, Result};
use crate::session::CanSession;

/// UDS service identifiers (ISO 14229-1).
pub mod services {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
    pub const READ_DTC_INFORMATION: u8 = 0x19;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
}

/// ReadDTCInformation sub-function: reportDTCByStatusMask.
const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;

/// Default per-request deadline. UDS services can be slow.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// Negative Response Codes
// ============================================================================

/// UDS negative response codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceedNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    /// 0x78: the ECU needs more time; the request stays alive.
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

impl Nrc {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x10 => Nrc::GeneralReject,
            0x11 => Nrc::ServiceNotSupported,
            0x12 => Nrc::SubFunctionNotSupported,
            0x13 => Nrc::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Nrc::ResponseTooLong,
            0x21 => Nrc::BusyRepeatRequest,
            0x22 => Nrc::ConditionsNotCorrect,
            0x24 => Nrc::RequestSequenceError,
            0x31 => Nrc::RequestOutOfRange,
            0x33 => Nrc::SecurityAccessDenied,
            0x35 => Nrc::InvalidKey,
            0x36 => Nrc::ExceedNumberOfAttempts,
            0x37 => Nrc::RequiredTimeDelayNotExpired,
            0x78 => Nrc::ResponsePending,
            0x7E => Nrc::SubFunctionNotSupportedInActiveSession,
            0x7F => Nrc::ServiceNotSupportedInActiveSession,
            other => Nrc::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Nrc::ResponseTooLong => 0x14,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestSequenceError => 0x24,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceedNumberOfAttempts => 0x36,
            Nrc::RequiredTimeDelayNotExpired => 0x37,
            Nrc::ResponsePending => 0x78,
            Nrc::SubFunctionNotSupportedInActiveSession => 0x7E,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for Nrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Nrc::GeneralReject => "General Reject",
            Nrc::ServiceNotSupported => "Service Not Supported",
            Nrc::SubFunctionNotSupported => "Sub-Function Not Supported",
            Nrc::IncorrectMessageLengthOrInvalidFormat => {
                "Incorrect Message Length Or Invalid Format"
            }
            Nrc::ResponseTooLong => "Response Too Long",
            Nrc::BusyRepeatRequest => "Busy Repeat Request",
            Nrc::ConditionsNotCorrect => "Conditions Not Correct",
            Nrc::RequestSequenceError => "Request Sequence Error",
            Nrc::RequestOutOfRange => "Request Out Of Range",
            Nrc::SecurityAccessDenied => "Security Access Denied",
            Nrc::InvalidKey => "Invalid Key",
            Nrc::ExceedNumberOfAttempts => "Exceed Number Of Attempts",
            Nrc::RequiredTimeDelayNotExpired => "Required Time Delay Not Expired",
            Nrc::ResponsePending => "Request Correctly Received - Response Pending",
            Nrc::SubFunctionNotSupportedInActiveSession => {
                "Sub-Function Not Supported In Active Session"
            }
            Nrc::ServiceNotSupportedInActiveSession => "Service Not Supported In Active Session",
            Nrc::Other(code) => return write!(f, "Unknown Error (0x{:02X})", code),
        };
        f.write_str(text)
    }
}

// ============================================================================
// Security Access Key Functions
// ============================================================================

/// Seed-to-key transform. Real ECUs use vendor-specific algorithms; inject
/// one with [`UdsClient::set_key_fn`].
pub type KeyFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Placeholder key function: byte-wise XOR with 0xAA.
pub fn xor_key(seed: &[u8]) -> Vec<u8> {
    seed.iter().map(|b| b ^ 0xAA).collect()
}

// ============================================================================
// Client
// ============================================================================

struct UdsSessionState {
    current_session: u8,
    security_level: u8,
    seeds: HashMap<u8, Vec<u8>>,
}

struct UdsInner {
    core: DiagCore,
    state: Mutex<UdsSessionState>,
    key_fn: Mutex<KeyFn>,
}

/// UDS engine bound to one session. Clones share state.
#[derive(Clone)]
pub struct UdsClient {
    inner: Arc<UdsInner>,
}

impl UdsClient {
    pub fn new(session: CanSession) -> Self {
        Self {
            inner: Arc::new(UdsInner {
                core: DiagCore::new(session, DEFAULT_TIMEOUT),
                state: Mutex::new(UdsSessionState {
                    current_session: 0x01,
                    security_level: 0,
                    seeds: HashMap::new(),
                }),
                key_fn: Mutex::new(Arc::new(xor_key)),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagEvent> {
        self.inner.core.subscribe()
    }

    pub fn set_request_id(&self, can_id: u32) {
        self.inner.core.set_request_id(can_id);
    }

    pub fn set_response_id(&self, can_id: u32) {
        self.inner.core.set_response_id(can_id);
    }

    /// Accept replies only from the configured response ID instead of the
    /// OBD-II style four-ID window.
    pub fn set_exact_response_match(&self, exact: bool) {
        self.inner.core.set_exact_response_match(exact);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.core.set_timeout(timeout);
    }

    /// Replace the seed-to-key transform used by [`unlock`](Self::unlock).
    pub fn set_key_fn(&self, key_fn: KeyFn) {
        *self.inner.key_fn.lock().unwrap() = key_fn;
    }

    /// Active diagnostic session type (0x01 default session).
    pub fn current_session(&self) -> u8 {
        self.inner.state.lock().unwrap().current_session
    }

    /// Unlocked security level, 0 when locked.
    pub fn security_level(&self) -> u8 {
        self.inner.state.lock().unwrap().security_level
    }

    /// Last seed received for a level.
    pub fn seed(&self, level: u8) -> Option<Vec<u8>> {
        self.inner.state.lock().unwrap().seeds.get(&level).cloned()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// DiagnosticSessionControl (0x10).
    pub async fn start_session(&self, session_type: u8) -> Result<()> {
        let request = [services::DIAGNOSTIC_SESSION_CONTROL, session_type];
        self.inner.core.execute(&request, Some(session_type)).await?;
        self.inner.state.lock().unwrap().current_session = session_type;
        info!("[uds] diagnostic session 0x{:02X} active", session_type);
        Ok(())
    }

    /// Return to the default session (0x01).
    pub async fn stop_session(&self) -> Result<()> {
        self.start_session(0x01).await
    }

    /// TesterPresent (0x3E), fire-and-forget.
    pub async fn tester_present(&self) -> Result<()> {
        self.inner.core.send_only(&[services::TESTER_PRESENT]).await
    }

    // ------------------------------------------------------------------
    // Data by identifier
    // ------------------------------------------------------------------

    /// ReadDataByIdentifier (0x22). Returns the record data.
    pub async fn read_data_by_identifier(&self, did: u16) -> Result<Vec<u8>> {
        let request = [
            services::READ_DATA_BY_IDENTIFIER,
            (did >> 8) as u8,
            did as u8,
        ];
        let response = self.inner.core.execute(&request, None).await?;
        if response.len() < 3 {
            return Err(Error::MalformedPdu(format!(
                "ReadDataByIdentifier response too short: {} bytes",
                response.len()
            )));
        }
        let echoed = ((response[1] as u16) << 8) | response[2] as u16;
        if echoed != did {
            return Err(Error::MalformedPdu(format!(
                "DID echo mismatch: requested 0x{:04X}, got 0x{:04X}",
                did, echoed
            )));
        }
        Ok(response[3..].to_vec())
    }

    /// WriteDataByIdentifier (0x2E).
    pub async fn write_data_by_identifier(&self, did: u16, data: &[u8]) -> Result<()> {
        let mut request = vec![
            services::WRITE_DATA_BY_IDENTIFIER,
            (did >> 8) as u8,
            did as u8,
        ];
        request.extend_from_slice(data);
        self.inner.core.execute(&request, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory access
    // ------------------------------------------------------------------

    /// ReadMemoryByAddress (0x23). Address and length are encoded in their
    /// minimal big-endian widths, announced by the leading format byte.
    pub async fn read_memory_by_address(&self, address: u32, length: u32) -> Result<Vec<u8>> {
        let request = build_read_memory_request(address, length);
        let response = self.inner.core.execute(&request, None).await?;
        Ok(response[1..].to_vec())
    }

    /// WriteMemoryByAddress (0x3D): address in its minimal width, then the
    /// literal data bytes running to the end of the PDU.
    pub async fn write_memory_by_address(&self, address: u32, data: &[u8]) -> Result<()> {
        let mut request = build_write_memory_prefix(address);
        request.extend_from_slice(data);
        self.inner.core.execute(&request, None).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // DTC
    // ------------------------------------------------------------------

    /// ClearDiagnosticInformation (0x14) for a DTC group (0xFF = all).
    pub async fn clear_dtc(&self, group_of_dtc: u8) -> Result<()> {
        let request = [
            services::CLEAR_DIAGNOSTIC_INFORMATION,
            0xFF,
            group_of_dtc,
            0xFF,
            0xFF,
            0xFF,
        ];
        self.inner.core.execute(&request, None).await?;
        Ok(())
    }

    /// ReadDTCInformation (0x19) sub 0x02: report DTCs matching a status
    /// mask. Records are 4 bytes: code hi, code lo, status, extended status.
    pub async fn read_dtc_by_status_mask(&self, status_mask: u8) -> Result<Vec<Dtc>> {
        let request = [
            services::READ_DTC_INFORMATION,
            REPORT_DTC_BY_STATUS_MASK,
            status_mask,
        ];
        let response = self
            .inner
            .core
            .execute(&request, Some(REPORT_DTC_BY_STATUS_MASK))
            .await?;

        // [0x59, 0x02, availability mask, records...]
        let records = if response.len() > 3 { &response[3..] } else { &[][..] };
        let dtcs: Vec<Dtc> = records
            .chunks_exact(4)
            .map(|record| {
                let code = ((record[0] as u16) << 8) | record[1] as u16;
                Dtc::new(code, record[2])
            })
            .collect();

        self.inner.core.emit(DiagEvent::DtcList(dtcs.clone()));
        Ok(dtcs)
    }

    /// Raw ReadDTCInformation (0x19) with an arbitrary sub-function.
    /// Returns the response after the service ID.
    pub async fn read_dtc_information(
        &self,
        sub_function: u8,
        params: &[u8],
    ) -> Result<Vec<u8>> {
        let mut request = vec![services::READ_DTC_INFORMATION, sub_function];
        request.extend_from_slice(params);
        let response = self.inner.core.execute(&request, Some(sub_function)).await?;
        Ok(response[1..].to_vec())
    }

    // ------------------------------------------------------------------
    // Security access
    // ------------------------------------------------------------------

    /// SecurityAccess (0x27) step one: request the seed for an odd level.
    pub async fn request_seed(&self, level: u8) -> Result<Vec<u8>> {
        let request = [services::SECURITY_ACCESS, level];
        let response = match self.inner.core.execute(&request, Some(level)).await {
            Ok(response) => response,
            Err(e) => return Err(self.report_denial(level, e)),
        };

        let seed = response[2..].to_vec();
        self.inner
            .state
            .lock()
            .unwrap()
            .seeds
            .insert(level, seed.clone());
        Ok(seed)
    }

    /// SecurityAccess step two: send the computed key at `level + 1`.
    pub async fn send_key(&self, level: u8, key: &[u8]) -> Result<()> {
        let mut request = vec![services::SECURITY_ACCESS, level + 1];
        request.extend_from_slice(key);
        match self.inner.core.execute(&request, Some(level + 1)).await {
            Ok(_) => {
                self.inner.state.lock().unwrap().security_level = level;
                self.inner.core.emit(DiagEvent::SecurityAccessGranted(level));
                info!("[uds] security access granted at level 0x{:02X}", level);
                Ok(())
            }
            Err(e) => Err(self.report_denial(level, e)),
        }
    }

    /// Run the full seed/key exchange for a level using the configured key
    /// function.
    pub async fn unlock(&self, level: u8) -> Result<()> {
        let seed = self.request_seed(level).await?;
        let key = {
            let key_fn = self.inner.key_fn.lock().unwrap();
            key_fn(&seed)
        };
        self.send_key(level, &key).await
    }

    fn report_denial(&self, level: u8, error: Error) -> Error {
        if let Error::Negative { nrc, .. } = &error {
            self.inner
                .core
                .emit(DiagEvent::SecurityAccessDenied { level, nrc: *nrc });
        }
        error
    }
}

// ============================================================================
// Request Builders
// ============================================================================

/// Smallest number of big-endian bytes that can represent `value`.
fn minimal_width(value: u32) -> u8 {
    if value < 0x100 {
        1
    } else if value < 0x1_0000 {
        2
    } else if value < 0x100_0000 {
        3
    } else {
        4
    }
}

fn push_be(out: &mut Vec<u8>, value: u32, width: u8) {
    for i in (0..width).rev() {
        out.push((value >> (i * 8)) as u8);
    }
}

fn build_read_memory_request(address: u32, length: u32) -> Vec<u8> {
    let addr_width = minimal_width(address);
    let len_width = minimal_width(length);
    let mut request = vec![
        services::READ_MEMORY_BY_ADDRESS,
        ((addr_width - 1) << 4) | (len_width - 1),
    ];
    push_be(&mut request, address, addr_width);
    push_be(&mut request, length, len_width);
    request
}

fn build_write_memory_prefix(address: u32) -> Vec<u8> {
    let addr_width = minimal_width(address);
    // Low nibble 0xF marks "data runs to the end of the PDU".
    let mut request = vec![
        services::WRITE_MEMORY_BY_ADDRESS,
        ((addr_width - 1) << 4) | 0x0F,
    ];
    push_be(&mut request, address, addr_width);
    request
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::link::mock::{MockHandle, MockLink};
    use crate::session::CanSession;

    /// Extract the PDU from a written Scanmatic envelope.
    fn pdu_of(envelope: &[u8]) -> Vec<u8> {
        let len = envelope[2] as usize;
        envelope[7..7 + len].to_vec()
    }

    fn reply(can_id: u32, pdu: &[u8]) -> Vec<Vec<u8>> {
        vec![codec::encode_can_frame(can_id, pdu).unwrap()]
    }

    async fn uds_fixture() -> (UdsClient, MockHandle, CanSession) {
        let session = CanSession::new();
        let (link, handle) = MockLink::new();
        session
            .connect_with_link(Box::new(link), 4096, Duration::from_millis(500))
            .await
            .unwrap();
        let uds = UdsClient::new(session.clone());
        uds.set_timeout(Duration::from_millis(500));
        (uds, handle, session)
    }

    #[test]
    fn test_nrc_round_trip() {
        assert_eq!(Nrc::from_code(0x33), Nrc::SecurityAccessDenied);
        assert_eq!(Nrc::from_code(0x78), Nrc::ResponsePending);
        assert_eq!(Nrc::from_code(0x35).code(), 0x35);
        assert_eq!(Nrc::from_code(0xEE), Nrc::Other(0xEE));
        assert_eq!(Nrc::Other(0xEE).to_string(), "Unknown Error (0xEE)");
        assert_eq!(Nrc::InvalidKey.to_string(), "Invalid Key");
    }

    #[test]
    fn test_xor_key() {
        assert_eq!(xor_key(&[0x11, 0x22]), vec![0xBB, 0x88]);
        assert_eq!(xor_key(&[]), Vec::<u8>::new());
    }

    #[test]
    fn test_read_memory_request_encoding() {
        // Two-byte address, one-byte length.
        assert_eq!(
            build_read_memory_request(0x1234, 0x10),
            vec![0x23, 0x10, 0x12, 0x34, 0x10]
        );
        // One-byte address and length.
        assert_eq!(
            build_read_memory_request(0x80, 0x04),
            vec![0x23, 0x00, 0x80, 0x04]
        );
        // Four-byte address, two-byte length.
        assert_eq!(
            build_read_memory_request(0x1234_5678, 0x0200),
            vec![0x23, 0x31, 0x12, 0x34, 0x56, 0x78, 0x02, 0x00]
        );
    }

    #[test]
    fn test_write_memory_prefix_encoding() {
        assert_eq!(
            build_write_memory_prefix(0x00C0_FFEE),
            vec![0x3D, 0x2F, 0xC0, 0xFF, 0xEE]
        );
    }

    #[tokio::test]
    async fn test_session_start_updates_state() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|written| {
            let pdu = pdu_of(written);
            assert_eq!(pdu, vec![0x10, 0x03]);
            reply(0x7E8, &[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])
        }));

        assert_eq!(uds.current_session(), 0x01);
        uds.start_session(0x03).await.unwrap();
        assert_eq!(uds.current_session(), 0x03);
    }

    #[tokio::test]
    async fn test_read_did_strips_echo() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|written| {
            assert_eq!(pdu_of(written), vec![0x22, 0xF1, 0x90]);
            reply(0x7E8, &[0x62, 0xF1, 0x90, 0xDE, 0xAD])
        }));

        let data = uds.read_data_by_identifier(0xF190).await.unwrap();
        assert_eq!(data, vec![0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_nrc_surfaces_as_negative_error() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|_| reply(0x7E8, &[0x7F, 0x22, 0x33])));

        let err = uds.read_data_by_identifier(0x1234).await.unwrap_err();
        match err {
            Error::Negative { service, nrc } => {
                assert_eq!(service, 0x22);
                assert_eq!(nrc, Nrc::SecurityAccessDenied);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_response_pending_keeps_request_alive() {
        let (uds, handle, _session) = uds_fixture().await;
        uds.set_timeout(Duration::from_millis(200));

        // 0x78 lands at ~100 ms and rearms the deadline to ~300 ms; the
        // positive response at ~250 ms is past the base 200 ms deadline but
        // inside the rearmed one.
        let script_handle = handle.clone();
        let script = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            script_handle.inject(codec::encode_can_frame(0x7E8, &[0x7F, 0x22, 0x78]).unwrap());
            tokio::time::sleep(Duration::from_millis(150)).await;
            script_handle
                .inject(codec::encode_can_frame(0x7E8, &[0x62, 0x00, 0x42, 0x99]).unwrap());
        });

        let data = uds.read_data_by_identifier(0x0042).await.unwrap();
        assert_eq!(data, vec![0x99]);
        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_pending_bounded_by_hard_cap() {
        let (uds, handle, _session) = uds_fixture().await;
        uds.set_timeout(Duration::from_millis(100));

        // Every write gets an endless stream of 0x78s: keep injecting them
        // from a background task and confirm the request still dies.
        handle.set_responder(Box::new(|_| {
            reply(0x7E8, &[0x7F, 0x22, 0x78])
        }));
        let pending_handle = handle.clone();
        let feeder = tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                pending_handle
                    .inject(codec::encode_can_frame(0x7E8, &[0x7F, 0x22, 0x78]).unwrap());
            }
        });

        let started = std::time::Instant::now();
        let err = uds.read_data_by_identifier(0x0001).await.unwrap_err();
        feeder.abort();

        assert!(matches!(err, Error::Timeout));
        // Bounded at 5x the engine timeout.
        assert!(started.elapsed() < Duration::from_millis(5 * 100 + 400));
    }

    #[tokio::test]
    async fn test_request_serialisation_second_caller_busy() {
        let (uds, _handle, _session) = uds_fixture().await;
        // No responder: the first request just sits against its deadline.
        let first = {
            let uds = uds.clone();
            tokio::spawn(async move { uds.read_data_by_identifier(0x0001).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = uds.read_data_by_identifier(0x0002).await.unwrap_err();
        assert!(matches!(err, Error::Busy));

        assert!(matches!(first.await.unwrap(), Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_security_access_seed_and_key() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|written| {
            let pdu = pdu_of(written);
            match pdu.as_slice() {
                [0x27, 0x01] => reply(0x7E8, &[0x67, 0x01, 0x11, 0x22]),
                [0x27, 0x02, 0xBB, 0x88] => reply(0x7E8, &[0x67, 0x02]),
                other => panic!("unexpected request: {:02X?}", other),
            }
        }));

        let mut events = uds.subscribe();
        uds.unlock(0x01).await.unwrap();

        assert_eq!(uds.security_level(), 0x01);
        assert_eq!(uds.seed(0x01), Some(vec![0x11, 0x22]));

        let mut granted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, DiagEvent::SecurityAccessGranted(0x01)) {
                granted = true;
            }
        }
        assert!(granted, "SecurityAccessGranted event expected");
    }

    #[tokio::test]
    async fn test_security_access_denied_event() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|written| {
            let pdu = pdu_of(written);
            match pdu.as_slice() {
                [0x27, 0x01] => reply(0x7E8, &[0x67, 0x01, 0x11, 0x22]),
                // Wrong key: InvalidKey.
                [0x27, 0x02, ..] => reply(0x7E8, &[0x7F, 0x27, 0x35]),
                other => panic!("unexpected request: {:02X?}", other),
            }
        }));

        let mut events = uds.subscribe();
        let err = uds.unlock(0x01).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Negative {
                nrc: Nrc::InvalidKey,
                ..
            }
        ));
        assert_eq!(uds.security_level(), 0);

        let mut denied = false;
        while let Ok(event) = events.try_recv() {
            if let DiagEvent::SecurityAccessDenied { level, nrc } = event {
                assert_eq!(level, 0x01);
                assert_eq!(nrc, Nrc::InvalidKey);
                denied = true;
            }
        }
        assert!(denied, "SecurityAccessDenied event expected");
    }

    #[tokio::test]
    async fn test_read_dtc_by_status_mask() {
        let (uds, handle, _session) = uds_fixture().await;
        // Availability mask 0xFF, then one 4-byte record; a single CAN
        // payload has room for exactly one.
        handle.set_responder(Box::new(|written| {
            assert_eq!(pdu_of(written), vec![0x19, 0x02, 0xAF]);
            reply(0x7E8, &[0x59, 0x02, 0xFF, 0x01, 0x33, 0x80, 0x00])
        }));

        let dtcs = uds.read_dtc_by_status_mask(0xAF).await.unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, 0x0133);
        assert_eq!(dtcs[0].to_string(), "P0133");
        assert!(dtcs[0].active);
    }

    #[tokio::test]
    async fn test_clear_dtc_request_layout() {
        let (uds, handle, _session) = uds_fixture().await;
        handle.set_responder(Box::new(|written| {
            assert_eq!(pdu_of(written), vec![0x14, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
            reply(0x7E8, &[0x54])
        }));

        uds.clear_dtc(0xFF).await.unwrap();
    }

    #[tokio::test]
    async fn test_tester_present_does_not_wait() {
        let (uds, handle, _session) = uds_fixture().await;
        // No responder installed; fire-and-forget must still return.
        uds.tester_present().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = handle.written();
        assert_eq!(written.len(), 1);
        assert_eq!(pdu_of(&written[0]), vec![0x3E]);
    }

    #[tokio::test]
    async fn test_exact_response_match_rejects_window() {
        let (uds, handle, _session) = uds_fixture().await;
        uds.set_timeout(Duration::from_millis(150));
        uds.set_exact_response_match(true);

        // Reply from 0x7EA: inside the default window, outside exact match.
        handle.set_responder(Box::new(|_| reply(0x7EA, &[0x62, 0x00, 0x01, 0x55])));

        let err = uds.read_data_by_identifier(0x0001).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_request() {
        let (uds, _handle, session) = uds_fixture().await;
        uds.set_timeout(Duration::from_secs(5));

        let pending = {
            let uds = uds.clone();
            tokio::spawn(async move { uds.read_data_by_identifier(0x0001).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.disconnect().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }
}
