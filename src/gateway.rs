// src/gateway.rs
//
// Thin command/event surface for the application layer: one session plus the
// two diagnostic engines bound to it. Pure plumbing, no protocol logic.

use tokio::sync::broadcast;

use crate::diag::obd2::Obd2Client;
use crate::diag::uds::UdsClient;
use crate::error::Result;
use crate::link::LinkProfile;
use crate::session::{CanSession, ConnectionState, SessionEvent, Statistics};

/// Bundles a [`CanSession`] with its OBD-II and UDS engines.
#[derive(Clone)]
pub struct Gateway {
    session: CanSession,
    obd2: Obd2Client,
    uds: UdsClient,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        let session = CanSession::new();
        let obd2 = Obd2Client::new(session.clone());
        let uds = UdsClient::new(session.clone());
        Self { session, obd2, uds }
    }

    pub async fn connect(&self, profile: LinkProfile) -> Result<()> {
        self.session.connect(profile).await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub async fn send(&self, can_id: u32, payload: &[u8]) -> Result<()> {
        self.session.send(can_id, payload).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn statistics(&self) -> Statistics {
        self.session.statistics()
    }

    pub fn session(&self) -> &CanSession {
        &self.session
    }

    pub fn obd2(&self) -> &Obd2Client {
        &self.obd2
    }

    pub fn uds(&self) -> &UdsClient {
        &self.uds
    }
}
