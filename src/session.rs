// src/session.rs
//
// CAN session layer: connection lifecycle, outbound validation, inbound
// dispatch with filtering, statistics, and event fan-out.
//
// One dispatch task per connection runs a single select loop over link
// messages and a 1 Hz statistics tick, so decoding, filtering and
// bookkeeping are serialised. External reads get snapshots; external
// mutations (filters, resets) go through the same shared state under short
// lock holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::codec::{self, FrameDecoder};
use crate::error::{Error, ErrorKind, Result};
use crate::link::{
    serial::SerialLink, usb::UsbLink, ByteLink, LinkMessage, LinkProfile, TransmitRequest,
    TransmitSender,
};
use crate::{format_can_message, CanFrame, CAN_ID_MAX, CAN_PAYLOAD_MAX};

/// Capacity of the link-to-dispatch message channel.
const LINK_CHANNEL_DEPTH: usize = 256;
/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_DEPTH: usize = 256;
/// How long disconnect waits for the dispatch task to drain before aborting.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Public Types
// ============================================================================

/// Connection state machine.
///
/// Disconnected --connect--> Initialising --init-ok--> Connected;
/// init failure rolls back to Disconnected; a resource loss while connected
/// moves to Error (observably disconnected) until the next connect or
/// disconnect normalises it.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", content = "message")]
pub enum ConnectionState {
    Disconnected,
    Initialising,
    Connected,
    Error(String),
}

/// Filter verdict for a configured CAN ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Allow,
    Deny,
}

/// Receive filter. Disabled passes everything; enabled passes a frame iff
/// its ID has no rule (default-allow) or the rule is Allow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilterTable {
    pub enabled: bool,
    pub rules: HashMap<u32, FilterAction>,
}

impl FilterTable {
    pub fn allows(&self, can_id: u32) -> bool {
        if !self.enabled {
            return true;
        }
        match self.rules.get(&can_id) {
            Some(FilterAction::Deny) => false,
            Some(FilterAction::Allow) | None => true,
        }
    }
}

/// Traffic counters. Monotonic except on explicit reset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    /// Timestamp (µs) of the first frame since the last reset.
    pub first_message_us: Option<u64>,
    /// Timestamp (µs) of the most recent frame.
    pub last_message_us: Option<u64>,
    /// Per-CAN-ID frame counts, both directions.
    pub per_id: HashMap<u32, u64>,
    /// Frames received so far in the current one-second window.
    pub rate_per_second: u64,
}

/// Events fanned out to subscribers.
#[derive(Clone, Debug, Serialize)]
pub enum SessionEvent {
    /// Edge-triggered on connection transitions.
    ConnectionStatusChanged(bool),
    /// Human-readable `ID=0x…, Data=…` line, post-filter.
    FrameReceivedText(String),
    /// Structured frame, post-filter.
    FrameReceived(CanFrame),
    /// Non-fatal and fatal errors; fatal ones also change connection status.
    ErrorOccurred {
        kind: ErrorKind,
        message: String,
        fatal: bool,
    },
    /// Pull model: consumers call `statistics()` on receipt.
    StatisticsUpdated,
}

// ============================================================================
// Session
// ============================================================================

struct Conn {
    link: Option<Box<dyn ByteLink>>,
    transmit_tx: Option<TransmitSender>,
    write_timeout: Duration,
    dispatch: Option<tokio::task::JoinHandle<()>>,
}

struct Shared {
    conn: tokio::sync::Mutex<Conn>,
    state: Mutex<ConnectionState>,
    stats: Mutex<Statistics>,
    filter: Mutex<FilterTable>,
    /// Frames received in the current one-second window; zeroed by the tick.
    rate_window: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn count_error(&self) {
        self.stats.lock().unwrap().errors += 1;
    }

    fn report_error(&self, error: &Error) {
        self.emit(SessionEvent::ErrorOccurred {
            kind: error.kind(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }
}

/// Handle to one adapter connection. Cheap to clone; all clones share the
/// same connection, statistics, filter table and event bus.
#[derive(Clone)]
pub struct CanSession {
    shared: Arc<Shared>,
}

impl Default for CanSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CanSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self {
            shared: Arc::new(Shared {
                conn: tokio::sync::Mutex::new(Conn {
                    link: None,
                    transmit_tx: None,
                    write_timeout: Duration::from_millis(1000),
                    dispatch: None,
                }),
                state: Mutex::new(ConnectionState::Disconnected),
                stats: Mutex::new(Statistics::default()),
                filter: Mutex::new(FilterTable::default()),
                rate_window: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Subscribe to session events. Each subscriber gets every event from
    /// the moment of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// Open the adapter described by `profile` and run the init handshake.
    pub async fn connect(&self, profile: LinkProfile) -> Result<()> {
        let write_timeout = Duration::from_millis(profile.write_timeout_ms());
        let max_buffer_bytes = profile.max_buffer_bytes();
        let link: Box<dyn ByteLink> = match profile {
            LinkProfile::Serial(config) => Box::new(SerialLink::new(config)),
            LinkProfile::Usb(config) => Box::new(UsbLink::new(config)),
        };
        self.connect_with_link(link, max_buffer_bytes, write_timeout)
            .await
    }

    /// Connect over an already-constructed link (used by tests with the
    /// mock link, and by applications with custom transports).
    pub async fn connect_with_link(
        &self,
        mut link: Box<dyn ByteLink>,
        max_buffer_bytes: usize,
        write_timeout: Duration,
    ) -> Result<()> {
        let mut conn = self.shared.conn.lock().await;

        // Connecting while connected re-connects.
        if self.is_connected() {
            self.teardown(&mut conn).await;
        }

        *self.shared.state.lock().unwrap() = ConnectionState::Initialising;
        let descriptor = link.descriptor();

        let (link_tx, link_rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
        match link.start(link_tx).await {
            Ok(transmit_tx) => {
                conn.link = Some(link);
                conn.transmit_tx = Some(transmit_tx);
                conn.write_timeout = write_timeout;
                conn.dispatch = Some(tokio::spawn(dispatch_loop(
                    self.shared.clone(),
                    link_rx,
                    max_buffer_bytes,
                )));

                self.reset_statistics();
                *self.shared.state.lock().unwrap() = ConnectionState::Connected;
                self.shared.emit(SessionEvent::ConnectionStatusChanged(true));
                info!("[session] connected to {}", descriptor);
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock().unwrap() = ConnectionState::Disconnected;
                self.shared.report_error(&e);
                warn!("[session] connect to {} failed: {}", descriptor, e);
                Err(e)
            }
        }
    }

    /// Close the link and drop any partial reassembly state. Idempotent.
    pub async fn disconnect(&self) {
        let mut conn = self.shared.conn.lock().await;
        let was_connected = self.is_connected();
        self.teardown(&mut conn).await;
        *self.shared.state.lock().unwrap() = ConnectionState::Disconnected;
        if was_connected {
            self.shared.emit(SessionEvent::ConnectionStatusChanged(false));
        }
    }

    async fn teardown(&self, conn: &mut Conn) {
        if let Some(mut link) = conn.link.take() {
            link.stop().await;
        }
        conn.transmit_tx = None;
        self.shared.rate_window.store(0, Ordering::Relaxed);
        if let Some(dispatch) = conn.dispatch.take() {
            // The link's Ended message lets the dispatch task drain and
            // exit; abort only if it never arrives.
            let abort = dispatch.abort_handle();
            if tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, dispatch)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
    }

    /// Transmit one CAN frame.
    pub async fn send(&self, can_id: u32, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            let err = Error::NotConnected;
            self.shared.report_error(&err);
            return Err(err);
        }
        if can_id > CAN_ID_MAX {
            let err = Error::CanIdOutOfRange(can_id);
            self.shared.count_error();
            self.shared.report_error(&err);
            return Err(err);
        }
        if payload.len() > CAN_PAYLOAD_MAX {
            let err = Error::FrameTooLong(payload.len());
            self.shared.count_error();
            self.shared.report_error(&err);
            return Err(err);
        }

        let frame = codec::encode_can_frame(can_id, payload)?;

        let (transmit_tx, write_timeout) = {
            let conn = self.shared.conn.lock().await;
            match &conn.transmit_tx {
                Some(tx) => (tx.clone(), conn.write_timeout),
                None => {
                    let err = Error::NotConnected;
                    self.shared.report_error(&err);
                    return Err(err);
                }
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        if transmit_tx
            .try_send(TransmitRequest {
                data: frame,
                result_tx,
            })
            .is_err()
        {
            let err = Error::WriteTimeout("transmit queue full".to_string());
            self.shared.count_error();
            self.shared.report_error(&err);
            return Err(err);
        }

        match tokio::time::timeout(write_timeout, result_rx).await {
            Ok(Ok(Ok(()))) => {
                let now = crate::now_us();
                {
                    let mut stats = self.shared.stats.lock().unwrap();
                    stats.sent += 1;
                    *stats.per_id.entry(can_id).or_insert(0) += 1;
                    if stats.first_message_us.is_none() {
                        stats.first_message_us = Some(now);
                    }
                    stats.last_message_us = Some(now);
                }
                self.shared.emit(SessionEvent::StatisticsUpdated);
                Ok(())
            }
            Ok(Ok(Err(msg))) => {
                // The link loop reports device loss separately; here the
                // caller just learns the write failed.
                let err = if msg.contains("timed out") {
                    Error::WriteTimeout(msg)
                } else {
                    Error::ConnectionLost(msg)
                };
                self.shared.count_error();
                self.shared.report_error(&err);
                Err(err)
            }
            Ok(Err(_)) => {
                let err = Error::ConnectionLost("link closed".to_string());
                self.shared.count_error();
                self.shared.report_error(&err);
                Err(err)
            }
            Err(_) => {
                let err = Error::WriteTimeout("no completion within write timeout".to_string());
                self.shared.count_error();
                self.shared.report_error(&err);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub fn set_filter_enabled(&self, enabled: bool) {
        self.shared.filter.lock().unwrap().enabled = enabled;
    }

    pub fn add_filter(&self, can_id: u32, action: FilterAction) {
        self.shared
            .filter
            .lock()
            .unwrap()
            .rules
            .insert(can_id, action);
    }

    pub fn clear_filters(&self) {
        self.shared.filter.lock().unwrap().rules.clear();
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Snapshot of the current counters.
    pub fn statistics(&self) -> Statistics {
        let mut stats = self.shared.stats.lock().unwrap().clone();
        stats.rate_per_second = self.shared.rate_window.load(Ordering::Relaxed);
        stats
    }

    pub fn reset_statistics(&self) {
        *self.shared.stats.lock().unwrap() = Statistics::default();
        self.shared.rate_window.store(0, Ordering::Relaxed);
        self.shared.emit(SessionEvent::StatisticsUpdated);
    }

    /// Frames received so far in the current one-second window.
    pub fn messages_per_second(&self) -> u64 {
        self.shared.rate_window.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Inbound Dispatch
// ============================================================================

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut link_rx: mpsc::Receiver<LinkMessage>,
    max_buffer_bytes: usize,
) {
    let mut decoder = FrameDecoder::new(max_buffer_bytes);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = link_rx.recv() => match message {
                Some(LinkMessage::Bytes(data)) => {
                    handle_bytes(&shared, &mut decoder, &data);
                }
                Some(LinkMessage::Error(message)) => {
                    shared.count_error();
                    shared.emit(SessionEvent::ErrorOccurred {
                        kind: ErrorKind::Link,
                        message,
                        fatal: false,
                    });
                    shared.emit(SessionEvent::StatisticsUpdated);
                }
                Some(LinkMessage::Lost(message)) => {
                    warn!("[session] link lost: {}", message);
                    shared.count_error();
                    *shared.state.lock().unwrap() = ConnectionState::Error(message.clone());
                    let err = Error::ConnectionLost(message);
                    shared.report_error(&err);
                    shared.emit(SessionEvent::ConnectionStatusChanged(false));
                }
                Some(LinkMessage::Ended(reason)) => {
                    debug!("[session] link ended: {}", reason);
                    break;
                }
                None => break,
            },
            _ = tick.tick() => {
                // Rolling per-second counter: report-then-zero.
                shared.rate_window.store(0, Ordering::Relaxed);
            }
        }
    }
}

fn handle_bytes(shared: &Arc<Shared>, decoder: &mut FrameDecoder, data: &[u8]) {
    let pending = decoder.buffered() + data.len();
    let batch = decoder.push(data);

    if batch.overflow {
        let err = Error::BufferOverflow { size: pending };
        shared.count_error();
        shared.report_error(&err);
        shared.emit(SessionEvent::StatisticsUpdated);
    }

    for frame in batch.frames {
        // The decoder only emits validated envelopes; re-check the frame
        // invariants anyway before anything observable happens.
        if frame.can_id > CAN_ID_MAX || frame.payload.len() > CAN_PAYLOAD_MAX {
            let err = Error::InvalidEnvelope(format!(
                "frame for ID 0x{:X} violates CAN limits",
                frame.can_id
            ));
            shared.count_error();
            shared.report_error(&err);
            continue;
        }

        if !shared.filter.lock().unwrap().allows(frame.can_id) {
            // Denied frames leave no observable trace.
            continue;
        }

        {
            let mut stats = shared.stats.lock().unwrap();
            stats.received += 1;
            *stats.per_id.entry(frame.can_id).or_insert(0) += 1;
            if stats.first_message_us.is_none() {
                stats.first_message_us = Some(frame.timestamp_us);
            }
            stats.last_message_us = Some(frame.timestamp_us);
        }
        shared.rate_window.fetch_add(1, Ordering::Relaxed);
        shared.emit(SessionEvent::StatisticsUpdated);

        shared.emit(SessionEvent::FrameReceivedText(format_can_message(
            frame.can_id,
            &frame.payload,
        )));
        shared.emit(SessionEvent::FrameReceived(frame));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;

    async fn connected_session() -> (CanSession, crate::link::mock::MockHandle) {
        let session = CanSession::new();
        let (link, handle) = MockLink::new();
        session
            .connect_with_link(Box::new(link), 4096, Duration::from_millis(500))
            .await
            .unwrap();
        (session, handle)
    }

    async fn next_frame(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<CanFrame> {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(SessionEvent::FrameReceived(frame))) => return Some(frame),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        let (session, handle) = connected_session().await;
        assert!(session.is_connected());

        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x7E8, &[0x41, 0x0D]).unwrap());

        let frame = next_frame(&mut rx).await.expect("frame dispatched");
        assert_eq!(frame.can_id, 0x7E8);
        assert_eq!(frame.payload, vec![0x41, 0x0D]);

        let stats = session.statistics();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.per_id.get(&0x7E8), Some(&1));
        assert!(stats.first_message_us.is_some());

        session.disconnect().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_receive_text_event() {
        let (session, handle) = connected_session().await;
        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x7E8, &[0x41, 0x0D]).unwrap());

        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(SessionEvent::FrameReceivedText(text))) => {
                    assert_eq!(text, "ID=0x7E8, Data=41 0D");
                    break;
                }
                Ok(Ok(_)) => continue,
                other => panic!("no text event: {:?}", other.is_err()),
            }
        }
    }

    #[tokio::test]
    async fn test_send_writes_envelope_and_counts() {
        let (session, handle) = connected_session().await;

        session.send(0x123, &[0x01, 0x02, 0x03]).await.unwrap();

        let written = handle.written();
        assert_eq!(written.len(), 1);
        assert_eq!(
            written[0],
            vec![0xAA, 0x02, 0x03, 0x00, 0x00, 0x01, 0x23, 0x01, 0x02, 0x03, 0x55]
        );

        let stats = session.statistics();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.per_id.get(&0x123), Some(&1));
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (session, _handle) = connected_session().await;

        assert!(matches!(
            session.send(0x2000_0000, &[]).await,
            Err(Error::CanIdOutOfRange(_))
        ));
        assert!(matches!(
            session.send(0x123, &[0u8; 9]).await,
            Err(Error::FrameTooLong(9))
        ));

        let stats = session.statistics();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let session = CanSession::new();
        assert!(matches!(
            session.send(0x123, &[0x01]).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_filter_semantics() {
        let (session, handle) = connected_session().await;
        session.set_filter_enabled(true);
        session.add_filter(0x100, FilterAction::Allow);
        session.add_filter(0x200, FilterAction::Deny);

        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x100, &[0x01]).unwrap());
        handle.inject(codec::encode_can_frame(0x200, &[0x02]).unwrap());
        handle.inject(codec::encode_can_frame(0x300, &[0x03]).unwrap());

        // Allowed rule and absent ID pass; Deny is dropped silently.
        let first = next_frame(&mut rx).await.unwrap();
        assert_eq!(first.can_id, 0x100);
        let second = next_frame(&mut rx).await.unwrap();
        assert_eq!(second.can_id, 0x300);

        let stats = session.statistics();
        assert_eq!(stats.received, 2);
        assert!(!stats.per_id.contains_key(&0x200));
    }

    #[tokio::test]
    async fn test_filter_disabled_passes_everything() {
        let (session, handle) = connected_session().await;
        session.set_filter_enabled(true);
        session.add_filter(0x200, FilterAction::Deny);
        session.set_filter_enabled(false);

        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x200, &[0x02]).unwrap());
        let frame = next_frame(&mut rx).await.unwrap();
        assert_eq!(frame.can_id, 0x200);
    }

    #[tokio::test]
    async fn test_link_loss_auto_disconnects() {
        let (session, handle) = connected_session().await;
        let mut rx = session.subscribe();

        handle.fail("device unplugged");

        let mut saw_fatal_error = false;
        let mut saw_status_down = false;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(SessionEvent::ErrorOccurred { fatal: true, .. })) => {
                    saw_fatal_error = true;
                }
                Ok(Ok(SessionEvent::ConnectionStatusChanged(false))) => {
                    saw_status_down = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_fatal_error, "fatal error event expected");
        assert!(saw_status_down, "status change expected");
        assert!(!session.is_connected());
        assert!(matches!(session.state(), ConnectionState::Error(_)));

        assert!(matches!(
            session.send(0x123, &[0x01]).await,
            Err(Error::NotConnected)
        ));

        // disconnect() normalises the error state.
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_overflow_counted_once() {
        let (session, handle) = connected_session().await;
        let mut rx = session.subscribe();

        handle.inject(vec![0x11u8; 5000]);

        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Ok(SessionEvent::ErrorOccurred { kind, fatal, .. })) => {
                    assert_eq!(kind, ErrorKind::Framing);
                    assert!(!fatal);
                    break;
                }
                Ok(Ok(_)) => continue,
                other => panic!("no overflow event: {:?}", other.is_err()),
            }
        }
        assert_eq!(session.statistics().errors, 1);

        // Still decodes after the overflow.
        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x42, &[0x01]).unwrap());
        assert_eq!(next_frame(&mut rx).await.unwrap().can_id, 0x42);
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let (session, handle) = connected_session().await;
        let mut rx = session.subscribe();
        handle.inject(codec::encode_can_frame(0x100, &[0x01]).unwrap());
        next_frame(&mut rx).await.unwrap();
        assert_eq!(session.statistics().received, 1);

        session.reset_statistics();
        let stats = session.statistics();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.rate_per_second, 0);
        assert!(stats.per_id.is_empty());
        assert!(stats.first_message_us.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let (session, _handle) = connected_session().await;
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_filter_table_default_allow() {
        let mut table = FilterTable::default();
        assert!(table.allows(0x100));
        table.enabled = true;
        table.rules.insert(0x100, FilterAction::Allow);
        table.rules.insert(0x200, FilterAction::Deny);
        assert!(table.allows(0x100));
        assert!(!table.allows(0x200));
        assert!(table.allows(0x300));
    }
}
