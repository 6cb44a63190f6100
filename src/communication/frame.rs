//! Wire framing for the device serial link.
//!
//! ```text
//! ┌────────────┬────────────┬──────────────────┬──────────────┬──────┐
//! │ Magic (2B) │ Length     │ Payload          │ CRC-16 (2B)  │ 0xFE │
//! │ 0xFF 0xAA  │ (2B LE)    │ (UTF-8 JSON)     │ LE, payload  │      │
//! └────────────┴────────────┴──────────────────┴──────────────┴──────┘
//! ```
//!
//! Decoding is a streaming scanner: it never blocks and never fails hard.
//! Bad frames are skipped by advancing past their header and searching for
//! the next magic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_16_MCRF4XX, Crc};

use crate::error::{FrameError, ProtocolError};

pub const MAGIC: [u8; 2] = [0xFF, 0xAA];
pub const TERMINATOR: u8 = 0xFE;
/// Magic + length.
pub const HEADER_SIZE: usize = 4;
/// CRC + terminator.
pub const TRAILER_SIZE: usize = 3;
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// CRC-16/MCRF4XX (reflected 0x1021, init 0xFFFF, no final xor).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Result of one decode attempt over the head of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A verified frame; `consumed` bytes should be dropped from the buffer.
    Frame { payload: Bytes, consumed: usize },
    /// More bytes are needed before anything can be said.
    Incomplete,
    /// Drop `consumed` bytes and try again.
    Resync { consumed: usize, reason: FrameError },
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u16::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        dst.put_slice(&MAGIC);
        dst.put_u16_le(payload.len() as u16);
        dst.put_slice(payload);
        dst.put_u16_le(crc16(payload));
        dst.put_u8(TERMINATOR);
        Ok(dst.freeze())
    }

    /// Inspect the head of `src` without consuming it.
    pub fn decode(&self, src: &[u8]) -> Decoded {
        match find_magic(src) {
            Some(0) => {}
            Some(pos) => {
                return Decoded::Resync {
                    consumed: pos,
                    reason: FrameError::Garbage,
                };
            }
            None => {
                // Keep a trailing 0xFF, it may be the first half of a header.
                let keep = usize::from(src.last() == Some(&MAGIC[0]));
                let consumed = src.len() - keep;
                if consumed == 0 {
                    return Decoded::Incomplete;
                }
                return Decoded::Resync {
                    consumed,
                    reason: FrameError::Garbage,
                };
            }
        }

        if src.len() < HEADER_SIZE {
            return Decoded::Incomplete;
        }
        let len = u16::from_le_bytes([src[2], src[3]]) as usize;
        if len > self.max_payload {
            return Decoded::Resync {
                consumed: MAGIC.len(),
                reason: FrameError::Oversize {
                    len,
                    max: self.max_payload,
                },
            };
        }

        let total = HEADER_SIZE + len + TRAILER_SIZE;
        if src.len() < total {
            return Decoded::Incomplete;
        }

        let terminator = src[total - 1];
        if terminator != TERMINATOR {
            return Decoded::Resync {
                consumed: MAGIC.len(),
                reason: FrameError::Terminator(terminator),
            };
        }

        let payload = &src[HEADER_SIZE..HEADER_SIZE + len];
        let actual = u16::from_le_bytes([src[HEADER_SIZE + len], src[HEADER_SIZE + len + 1]]);
        let expected = crc16(payload);
        if actual != expected {
            return Decoded::Resync {
                consumed: MAGIC.len(),
                reason: FrameError::Checksum { expected, actual },
            };
        }

        Decoded::Frame {
            payload: Bytes::copy_from_slice(payload),
            consumed: total,
        }
    }
}

fn find_magic(src: &[u8]) -> Option<usize> {
    src.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Accumulating decoder fed with whatever the serial read returned.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
    resyncs: u64,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            resyncs: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next verified payload, skipping over anything that fails to decode.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.codec.decode(&self.buffer) {
                Decoded::Frame { payload, consumed } => {
                    self.buffer.advance(consumed);
                    return Some(payload);
                }
                Decoded::Incomplete => return None,
                Decoded::Resync { consumed, reason } => {
                    self.resyncs += 1;
                    if reason == FrameError::Garbage {
                        tracing::trace!("Discarding {} stray bytes", consumed);
                    } else {
                        tracing::warn!("Frame rejected ({}), resynchronizing", reason);
                    }
                    self.buffer.advance(consumed);
                }
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
