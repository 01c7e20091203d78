// src/link/serial.rs
//
// Serial-port link to the Scanmatic 2 Pro adapter.
//
// The adapter enumerates as a USB CDC serial device. Open sequence: open the
// port 8-N-1 at the baud rate mapped from the CAN bitrate, clear the OS
// buffers, give the device 100 ms to boot, write the init envelope (up to 5 s
// for the write to complete), wait 200 ms for the adapter to settle, then
// clear the input buffer before streaming.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    parse_port_name, serial_baud_for_bitrate, speed_code_for_bitrate, ByteLink, LinkMessage,
    SerialLinkConfig, TransmitRequest, TransmitSender, TRANSMIT_QUEUE_DEPTH,
};
use crate::codec;
use crate::error::{Error, Result};

/// Time allowed for the adapter to accept the init command.
const INIT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay after opening the port before the device accepts commands.
const BOOT_DELAY: Duration = Duration::from_millis(100);
/// Delay after the init command before the adapter starts streaming.
const INIT_SETTLE_DELAY: Duration = Duration::from_millis(200);

pub struct SerialLink {
    config: SerialLinkConfig,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(config: SerialLinkConfig) -> Self {
        Self {
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait]
impl ByteLink for SerialLink {
    async fn start(&mut self, events: mpsc::Sender<LinkMessage>) -> Result<TransmitSender> {
        let config = self.config.clone();
        let port = tokio::task::spawn_blocking(move || open_and_init(&config))
            .await
            .map_err(|e| Error::PortBusy(format!("open task failed: {}", e)))??;

        let (transmit_tx, transmit_rx) =
            std_mpsc::sync_channel::<TransmitRequest>(TRANSMIT_QUEUE_DEPTH);

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = self.stop_flag.clone();
        let descriptor = self.descriptor();

        self.task = Some(tokio::task::spawn_blocking(move || {
            read_loop(port, descriptor, transmit_rx, stop_flag, events);
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
        format!("serial({})", self.config.port)
    }
}

/// Open the port and run the adapter handshake. Blocking.
fn open_and_init(config: &SerialLinkConfig) -> Result<Box<dyn serialport::SerialPort>> {
    let port_name = parse_port_name(&config.port)?;
    let baud_rate = serial_baud_for_bitrate(config.bitrate_kbps)?;
    let speed_code = speed_code_for_bitrate(config.bitrate_kbps)?;

    debug!(
        "[serial] opening {} at {} baud (CAN {} kbit/s)",
        port_name, baud_rate, config.bitrate_kbps
    );

    let mut port = serialport::new(&port_name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(config.read_timeout_ms))
        .open()
        .map_err(|e| Error::from_serial_open(&port_name, e))?;

    let _ = port.clear(serialport::ClearBuffer::All);

    // Device boot delay after the port opens.
    std::thread::sleep(BOOT_DELAY);

    // Init command: AA 01 <speed_code> 00 55. The adapter can be slow to
    // accept its first write, so widen the timeout for just this exchange.
    let init_cmd = codec::encode_init_command(speed_code);
    let _ = port.set_timeout(INIT_WRITE_TIMEOUT);
    port.write_all(&init_cmd)
        .and_then(|_| port.flush())
        .map_err(|e| Error::LinkIo {
            context: format!("writing init command to {}", port_name),
            source: e,
        })?;
    let _ = port.set_timeout(Duration::from_millis(config.read_timeout_ms));

    std::thread::sleep(INIT_SETTLE_DELAY);
    let _ = port.clear(serialport::ClearBuffer::Input);

    info!(
        "[serial] {} initialised (speed code 0x{:02X})",
        port_name, speed_code
    );

    Ok(port)
}

/// Blocking I/O loop: drain transmit requests, read, forward bytes upward.
fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    descriptor: String,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    stop_flag: Arc<AtomicBool>,
    events: mpsc::Sender<LinkMessage>,
) {
    let mut read_buf = [0u8; 1024];

    while !stop_flag.load(Ordering::SeqCst) {
        // Writes first so a queued request is not starved by a busy bus.
        while let Ok(req) = transmit_rx.try_recv() {
            match port.write_all(&req.data).and_then(|_| port.flush()) {
                Ok(()) => {
                    let _ = req.result_tx.send(Ok(()));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    let _ = req.result_tx.send(Err(format!("write timed out: {}", e)));
                }
                Err(e) => {
                    // Anything but a timeout means the device is gone.
                    let msg = format!("write error: {}", e);
                    let _ = req.result_tx.send(Err(msg.clone()));
                    warn!("[serial] {} lost during write: {}", descriptor, msg);
                    let _ = events.blocking_send(LinkMessage::Lost(msg));
                    let _ = events.blocking_send(LinkMessage::Ended("lost".to_string()));
                    return;
                }
            }
        }

        match port.read(&mut read_buf) {
            Ok(0) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(n) => {
                let _ = events.blocking_send(LinkMessage::Bytes(read_buf[..n].to_vec()));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Quiet bus; keep polling.
            }
            Err(e) => {
                let msg = format!("read error: {}", e);
                warn!("[serial] {} lost: {}", descriptor, msg);
                let _ = events.blocking_send(LinkMessage::Lost(msg));
                let _ = events.blocking_send(LinkMessage::Ended("lost".to_string()));
                return;
            }
        }
    }

    debug!("[serial] {} stopped", descriptor);
    let _ = events.blocking_send(LinkMessage::Ended("stopped".to_string()));
}
