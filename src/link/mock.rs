// src/link/mock.rs
//
// In-memory link used by session and diagnostic-engine tests: inbound bytes
// are scripted through a handle, outbound writes are recorded, and an
// optional responder turns each write into simulated adapter traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ByteLink, LinkMessage, TransmitRequest, TransmitSender, TRANSMIT_QUEUE_DEPTH};
use crate::error::Result;

/// Closure mapping one written chunk to the byte chunks the adapter answers
/// with.
pub type MockResponder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockShared {
    written: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<MockResponder>>,
    events: Mutex<Option<mpsc::Sender<LinkMessage>>>,
}

/// Test-side control handle for a [`MockLink`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Feed raw bytes to the session as if received from the adapter.
    pub fn inject(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.shared.events.lock().unwrap().clone() {
            let _ = tx.try_send(LinkMessage::Bytes(bytes));
        }
    }

    /// Simulate the device disappearing.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = self.shared.events.lock().unwrap().clone() {
            let _ = tx.try_send(LinkMessage::Lost(reason.to_string()));
            let _ = tx.try_send(LinkMessage::Ended("lost".to_string()));
        }
    }

    /// Everything written to the link so far, one entry per write.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.written.lock().unwrap().clone()
    }

    /// Install a responder invoked on every write.
    pub fn set_responder(&self, responder: MockResponder) {
        *self.shared.responder.lock().unwrap() = Some(responder);
    }
}

pub struct MockLink {
    shared: Arc<MockShared>,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MockLink {
    pub fn new() -> (Self, MockHandle) {
        let shared = Arc::new(MockShared::default());
        let handle = MockHandle {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                stop_flag: Arc::new(AtomicBool::new(false)),
                task: None,
            },
            handle,
        )
    }
}

#[async_trait]
impl ByteLink for MockLink {
    async fn start(&mut self, events: mpsc::Sender<LinkMessage>) -> Result<TransmitSender> {
        *self.shared.events.lock().unwrap() = Some(events.clone());

        let (transmit_tx, transmit_rx) =
            std_mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = self.stop_flag.clone();
        let shared = self.shared.clone();

        self.task = Some(tokio::task::spawn_blocking(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                while let Ok(req) = transmit_rx.try_recv() {
                    shared.written.lock().unwrap().push(req.data.clone());
                    let _ = req.result_tx.send(Ok(()));

                    let replies = {
                        let mut responder = shared.responder.lock().unwrap();
                        responder
                            .as_mut()
                            .map(|f| f(&req.data))
                            .unwrap_or_default()
                    };
                    for chunk in replies {
                        let _ = events.blocking_send(LinkMessage::Bytes(chunk));
                    }
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = events.blocking_send(LinkMessage::Ended("stopped".to_string()));
        }));

        Ok(transmit_tx)
    }

    async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn descriptor(&self) -> String {
        "mock".to_string()
    }
}
