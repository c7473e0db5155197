//! Stream codec for binary packets and admin text lines.
//!
//! Binary packets always start with a zero byte (the first byte of the
//! magic). Any other leading byte switches the decoder into line mode for
//! one LF-terminated admin command.

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Packet;
use crate::types::HEADER_LEN;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default payload ceiling.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Default admin line ceiling.
pub const DEFAULT_MAX_LINE: usize = 8 * 1024;

/// One unit read from or written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// An admin command (inbound, trimmed) or a raw admin response (outbound).
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Payload { magic: u32, kind: u32, length: usize },
}

/// Incremental decoder that tolerates arbitrary read fragmentation.
#[derive(Debug)]
pub struct PacketCodec {
    state: DecodeState,
    max_payload: usize,
    max_line: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_LINE)
    }
}

impl PacketCodec {
    pub fn new(max_payload: usize, max_line: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload,
            max_line,
        }
    }

    fn decode_line(&self, src: &mut BytesMut) -> ProtocolResult<Option<Option<String>>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_line {
                return Err(ProtocolError::LineTooLong { max: self.max_line });
            }
            return Ok(None);
        };
        if pos > self.max_line {
            return Err(ProtocolError::LineTooLong { max: self.max_line });
        }
        let line = src.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text.is_empty() {
            Ok(Some(None))
        } else {
            Ok(Some(Some(text)))
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(first) = src.first().copied() else {
                        return Ok(None);
                    };

                    if first != 0 {
                        match self.decode_line(src)? {
                            None => return Ok(None),
                            // Blank line, keep scanning.
                            Some(None) => continue,
                            Some(Some(text)) => return Ok(Some(Frame::Text(text))),
                        }
                    }

                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }

                    let magic = src.get_u32();
                    let kind = src.get_u32();
                    let length = src.get_u32() as usize;
                    if length > self.max_payload {
                        return Err(ProtocolError::PayloadTooLarge {
                            size: length,
                            max: self.max_payload,
                        });
                    }

                    trace!(magic, kind, length, "Decoded packet header");
                    src.reserve(length);
                    self.state = DecodeState::Payload {
                        magic,
                        kind,
                        length,
                    };
                }
                DecodeState::Payload {
                    magic,
                    kind,
                    length,
                } => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    let payload = src.split_to(length);
                    // Reset before parsing so a rejected packet leaves the
                    // stream aligned on the next header.
                    self.state = DecodeState::Header;
                    return Packet::from_parts(magic, kind, &payload).map(|p| Some(Frame::Packet(p)));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && self.state == DecodeState::Header => Ok(None),
            None => Err(ProtocolError::Truncated {
                remaining: buf.len(),
            }),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.encode_into(dst);
        Ok(())
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            Frame::Packet(packet) => packet.encode_into(dst),
            Frame::Text(text) => dst.extend_from_slice(text.as_bytes()),
        }
        Ok(())
    }
}
