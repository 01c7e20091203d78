// src/link/usb.rs
//
// Direct USB bulk link to the Scanmatic 2 Pro adapter, for hosts where the
// device does not enumerate as a serial port.
//
// The adapter speaks the same envelope protocol over bulk endpoints:
// IN 0x81 for received data, OUT 0x01 for commands and transmit frames.
// Interface 0 is claimed (nusb detaches a bound kernel driver where the
// platform supports that).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    speed_code_for_bitrate, ByteLink, LinkMessage, TransmitRequest, TransmitSender, UsbLinkConfig,
    TRANSMIT_QUEUE_DEPTH,
};
use crate::codec;
use crate::error::{Error, Result};

/// Bulk IN endpoint delivering adapter data.
const BULK_IN_ENDPOINT: u8 = 0x81;
/// Bulk OUT endpoint accepting commands and frames.
const BULK_OUT_ENDPOINT: u8 = 0x01;
/// Receive poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Size of each queued IN transfer.
const READ_TRANSFER_LEN: usize = 512;
/// Number of IN transfers kept in flight.
const READ_TRANSFER_DEPTH: usize = 4;

pub struct UsbLink {
    config: UsbLinkConfig,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl UsbLink {
    pub fn new(config: UsbLinkConfig) -> Self {
        Self {
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait]
impl ByteLink for UsbLink {
    async fn start(&mut self, events: mpsc::Sender<LinkMessage>) -> Result<TransmitSender> {
        let descriptor = self.descriptor();
        let speed_code = speed_code_for_bitrate(self.config.bitrate_kbps)?;

        // Locate the adapter by VID/PID.
        let device_info = nusb::list_devices()
            .await
            .map_err(|e| Error::PortBusy(format!("USB enumeration failed: {}", e)))?
            .find(|dev| {
                dev.vendor_id() == self.config.vendor_id
                    && dev.product_id() == self.config.product_id
            })
            .ok_or_else(|| Error::DeviceNotFound(descriptor.clone()))?;

        let device = device_info
            .open()
            .await
            .map_err(|e| map_open_error(&descriptor, e))?;

        let interface = device
            .claim_interface(0)
            .await
            .map_err(|e| Error::PortBusy(format!("{}: claim interface 0: {}", descriptor, e)))?;

        let mut bulk_in = interface
            .endpoint::<nusb::transfer::Bulk, nusb::transfer::In>(BULK_IN_ENDPOINT)
            .map_err(|e| Error::PortBusy(format!("{}: bulk IN endpoint: {}", descriptor, e)))?;
        let mut bulk_out = interface
            .endpoint::<nusb::transfer::Bulk, nusb::transfer::Out>(BULK_OUT_ENDPOINT)
            .map_err(|e| Error::PortBusy(format!("{}: bulk OUT endpoint: {}", descriptor, e)))?;

        debug!("[usb] {} opened, sending init", descriptor);

        // Same handshake as the serial path: boot delay, init envelope,
        // settle delay.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let init_cmd = codec::encode_init_command(speed_code);
        write_bulk(&mut bulk_out, &init_cmd, Duration::from_secs(5))
            .await
            .map_err(|e| Error::PortBusy(format!("{}: init command: {}", descriptor, e)))?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        info!(
            "[usb] {} initialised (speed code 0x{:02X})",
            descriptor, speed_code
        );

        let (transmit_tx, transmit_rx) =
            std_mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = self.stop_flag.clone();
        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);

        self.task = Some(tokio::spawn(async move {
            io_loop(
                bulk_in,
                bulk_out,
                descriptor,
                transmit_rx,
                write_timeout,
                stop_flag,
                events,
            )
            .await;
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
        format!(
            "usb({:04X}:{:04X})",
            self.config.vendor_id, self.config.product_id
        )
    }
}

fn map_open_error(descriptor: &str, err: impl std::fmt::Display) -> Error {
    let text = err.to_string();
    if text.contains("permission") || text.contains("Access") {
        Error::PermissionDenied(descriptor.to_string())
    } else {
        Error::PortBusy(format!("{}: {}", descriptor, text))
    }
}

/// Submit one OUT transfer and wait for its completion.
async fn write_bulk(
    bulk_out: &mut nusb::Endpoint<nusb::transfer::Bulk, nusb::transfer::Out>,
    data: &[u8],
    timeout: Duration,
) -> std::result::Result<(), String> {
    let mut buf = bulk_out.allocate(data.len());
    buf.extend_from_slice(data);
    bulk_out.submit(buf);

    match tokio::time::timeout(timeout, bulk_out.next_complete()).await {
        Ok(completion) => completion
            .status
            .map_err(|e| format!("bulk OUT transfer: {:?}", e)),
        Err(_) => Err("bulk OUT transfer timed out".to_string()),
    }
}

async fn io_loop(
    mut bulk_in: nusb::Endpoint<nusb::transfer::Bulk, nusb::transfer::In>,
    mut bulk_out: nusb::Endpoint<nusb::transfer::Bulk, nusb::transfer::Out>,
    descriptor: String,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    write_timeout: Duration,
    stop_flag: Arc<AtomicBool>,
    events: mpsc::Sender<LinkMessage>,
) {
    // Keep several IN transfers queued for throughput.
    for _ in 0..READ_TRANSFER_DEPTH {
        bulk_in.submit(bulk_in.allocate(READ_TRANSFER_LEN));
    }

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            let _ = events.send(LinkMessage::Ended("stopped".to_string())).await;
            return;
        }

        // Drain queued writes.
        while let Ok(req) = transmit_rx.try_recv() {
            let result = write_bulk(&mut bulk_out, &req.data, write_timeout).await;
            let failed = result.as_ref().err().cloned();
            let _ = req.result_tx.send(result);
            if let Some(msg) = failed {
                if !msg.contains("timed out") {
                    warn!("[usb] {} lost during write: {}", descriptor, msg);
                    let _ = events.send(LinkMessage::Lost(msg)).await;
                    let _ = events.send(LinkMessage::Ended("lost".to_string())).await;
                    return;
                }
            }
        }

        // Poll the IN endpoint; a timeout just means a quiet bus.
        match tokio::time::timeout(POLL_INTERVAL, bulk_in.next_complete()).await {
            Ok(completion) => match completion.status {
                Ok(()) => {
                    let len = completion.actual_len;
                    if len > 0 {
                        let _ = events
                            .send(LinkMessage::Bytes(completion.buffer[..len].to_vec()))
                            .await;
                    }
                    bulk_in.submit(bulk_in.allocate(READ_TRANSFER_LEN));
                }
                Err(e) => {
                    let msg = format!("bulk IN transfer: {:?}", e);
                    warn!("[usb] {} lost: {}", descriptor, msg);
                    let _ = events.send(LinkMessage::Lost(msg)).await;
                    let _ = events.send(LinkMessage::Ended("lost".to_string())).await;
                    return;
                }
            },
            Err(_) => {
                // No data within the poll interval.
            }
        }
    }
}
