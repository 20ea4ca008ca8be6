//! Length-prefixed CBOR framing for packets on the duplex stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR packet]`

use std::collections::VecDeque;
use std::io::Cursor;

use crate::error::{TunnelError, TunnelResult};
use crate::packet::Packet;

/// Largest payload a single frame may declare.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a packet into a length-prefixed CBOR frame.
pub fn frame_encode(packet: &Packet) -> TunnelResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(packet, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::Codec(format!(
            "packet too large: {} bytes (max {MAX_FRAME_LEN})",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a packet.
pub fn packet_decode(data: &[u8]) -> TunnelResult<Packet> {
    let cursor = Cursor::new(data);
    let packet: Packet = ciborium::from_reader(cursor)?;
    Ok(packet)
}

/// Streaming frame decoder: accumulates bytes and yields complete packets.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return every packet completed by them,
    /// in arrival order.
    pub fn feed(&mut self, data: &[u8]) -> TunnelResult<VecDeque<Packet>> {
        self.buffer.extend_from_slice(data);
        let mut packets = VecDeque::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if len > MAX_FRAME_LEN {
                self.buffer.clear();
                return Err(TunnelError::Codec(format!(
                    "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
                )));
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            let packet = packet_decode(&self.buffer[4..4 + len]);
            self.buffer.drain(..4 + len);
            packets.push_back(packet?);
        }

        Ok(packets)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
