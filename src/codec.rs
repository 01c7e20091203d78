// src/codec.rs
//
// Scanmatic 2 Pro envelope codec.
//
// Frame format (both directions):
//   [0xAA][type][length][CAN ID - 4 bytes BE][data 0..8][0x55]
//
// Frame types:
//   0x01 - init/command (outbound only): [0xAA][0x01][speed_code][0x00][0x55]
//   0x02 - CAN data
//
// The decoder reassembles envelopes from an arbitrary byte stream: partial
// deliveries are buffered, corruption is skipped one byte at a time until the
// stream resynchronises, and the buffer is bounded by `max_buffer_bytes`.

use crate::error::{Error, Result};
use crate::CanFrame;

/// Protocol constants.
pub mod constants {
    /// Start-of-envelope marker.
    pub const FRAME_START: u8 = 0xAA;
    /// End-of-envelope marker.
    pub const FRAME_END: u8 = 0x55;
    /// Envelope type: adapter init command.
    pub const TYPE_INIT: u8 = 0x01;
    /// Envelope type: CAN data.
    pub const TYPE_CAN_DATA: u8 = 0x02;
    /// start + type + length
    pub const HEADER_LEN: usize = 3;
    /// header + CAN ID (4) + max data (8) + end
    pub const MAX_ENVELOPE_LEN: usize = HEADER_LEN + 4 + 8 + 1;
}

use constants::*;

/// Encode a CAN frame into a Scanmatic data envelope.
///
/// Layout: `AA 02 <len> <id_b3> <id_b2> <id_b1> <id_b0> <payload...> 55`.
pub fn encode_can_frame(can_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if can_id > crate::CAN_ID_MAX {
        return Err(Error::CanIdOutOfRange(can_id));
    }
    if payload.len() > crate::CAN_PAYLOAD_MAX {
        return Err(Error::FrameTooLong(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + 4 + payload.len() + 1);
    frame.push(FRAME_START);
    frame.push(TYPE_CAN_DATA);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(&can_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    Ok(frame)
}

/// Encode the adapter init command carrying the CAN bus speed code.
///
/// Layout: `AA 01 <speed_code> 00 55` (the fourth byte is reserved).
pub fn encode_init_command(speed_code: u8) -> Vec<u8> {
    vec![FRAME_START, TYPE_INIT, speed_code, 0x00, FRAME_END]
}

/// Result of feeding bytes to the decoder.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    /// Complete frames, in the order their last byte arrived.
    pub frames: Vec<CanFrame>,
    /// The reassembly buffer would have exceeded its cap and was dropped.
    pub overflow: bool,
}

/// Stateful reassembler for the inbound byte stream.
///
/// Owns the accumulation buffer; the session feeds it raw chunks from the
/// link and dispatches whatever complete frames come back.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_buffer_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_buffer_bytes: usize) -> Self {
        // 1 KiB floor keeps a burst of back-to-back envelopes decodable.
        let max_buffer_bytes = max_buffer_bytes.max(1024);
        Self {
            buffer: Vec::with_capacity(max_buffer_bytes.min(4096)),
            max_buffer_bytes,
        }
    }

    /// Append received bytes and extract every complete envelope.
    pub fn push(&mut self, data: &[u8]) -> DecodedBatch {
        let mut batch = DecodedBatch::default();

        // Overflow containment happens before the append: drop the stale
        // buffer and continue with only the new bytes.
        if self.buffer.len() + data.len() > self.max_buffer_bytes {
            batch.overflow = true;
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= HEADER_LEN {
            // Find the start marker; everything before it is noise.
            let start = match self.buffer.iter().position(|b| *b == FRAME_START) {
                Some(i) => i,
                None => {
                    self.buffer.clear();
                    break;
                }
            };
            if start > 0 {
                self.buffer.drain(0..start);
            }
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let frame_type = self.buffer[1];
            let data_len = self.buffer[2] as usize;

            if frame_type != TYPE_CAN_DATA || data_len > crate::CAN_PAYLOAD_MAX {
                // Unknown type or impossible length: the start byte was part
                // of something else. Skip it and rescan.
                self.buffer.drain(0..1);
                continue;
            }

            let expected = HEADER_LEN + 4 + data_len + 1;
            if self.buffer.len() < expected {
                // Wait for the rest of the envelope.
                break;
            }

            if self.buffer[expected - 1] != FRAME_END {
                // End marker not where the declared length says it must be;
                // advance one byte so a valid envelope inside the garbage is
                // never skipped.
                self.buffer.drain(0..1);
                continue;
            }

            let can_id = u32::from_be_bytes(
                self.buffer[HEADER_LEN..HEADER_LEN + 4]
                    .try_into()
                    .unwrap_or([0; 4]),
            );
            let payload = self.buffer[HEADER_LEN + 4..HEADER_LEN + 4 + data_len].to_vec();
            self.buffer.drain(0..expected);

            // Timestamp is taken at extraction of the complete envelope.
            batch.frames.push(CanFrame::received(can_id, payload));
        }

        batch
    }

    /// Bytes currently held waiting for the rest of an envelope.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial state (called on disconnect).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
