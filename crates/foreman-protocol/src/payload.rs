//! NUL-separated payload fields.
//!
//! Every field except the last is terminated by `\0`; the last field is
//! the raw remainder of the payload and carries no terminator.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::PacketType;
use bytes::{BufMut, Bytes, BytesMut};
use std::str::FromStr;

/// Left-to-right reader over a packet payload.
pub(crate) struct PayloadReader<'a> {
    packet: PacketType,
    rest: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(packet: PacketType, payload: &'a [u8]) -> Self {
        Self {
            packet,
            rest: payload,
        }
    }

    /// Next NUL-terminated field.
    pub(crate) fn field(&mut self, name: &'static str) -> ProtocolResult<&'a [u8]> {
        match self.rest.iter().position(|b| *b == 0) {
            Some(pos) => {
                let value = &self.rest[..pos];
                self.rest = &self.rest[pos + 1..];
                Ok(value)
            }
            None => Err(ProtocolError::MissingField {
                packet: self.packet.name(),
                field: name,
            }),
        }
    }

    pub(crate) fn string(&mut self, name: &'static str) -> ProtocolResult<String> {
        let raw = self.field(name)?;
        self.utf8(raw, name)
    }

    pub(crate) fn number<T: FromStr>(&mut self, name: &'static str) -> ProtocolResult<T> {
        let raw = self.field(name)?;
        self.parse(raw, name)
    }

    pub(crate) fn flag(&mut self, name: &'static str) -> ProtocolResult<bool> {
        let value: u8 = self.number(name)?;
        Ok(value != 0)
    }

    /// Everything left, unterminated.
    pub(crate) fn remainder(self) -> &'a [u8] {
        self.rest
    }

    pub(crate) fn remainder_bytes(self) -> Bytes {
        Bytes::copy_from_slice(self.rest)
    }

    pub(crate) fn remainder_string(self, name: &'static str) -> ProtocolResult<String> {
        let raw = self.rest;
        self.utf8(raw, name)
    }

    pub(crate) fn remainder_number<T: FromStr>(self, name: &'static str) -> ProtocolResult<T> {
        let raw = self.rest;
        self.parse(raw, name)
    }

    fn utf8(&self, raw: &[u8], name: &'static str) -> ProtocolResult<String> {
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8 {
                packet: self.packet.name(),
                field: name,
            })
    }

    fn parse<T: FromStr>(&self, raw: &[u8], name: &'static str) -> ProtocolResult<T> {
        let text = self.utf8(raw, name)?;
        text.parse().map_err(|_| ProtocolError::InvalidNumber {
            packet: self.packet.name(),
            field: name,
            value: text,
        })
    }
}

/// Builds a payload field by field.
#[derive(Default)]
pub(crate) struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub(crate) fn field(mut self, value: impl AsRef<[u8]>) -> Self {
        self.buf.put_slice(value.as_ref());
        self.buf.put_u8(0);
        self
    }

    pub(crate) fn flag(self, value: bool) -> Self {
        self.field(if value { "1" } else { "0" })
    }

    pub(crate) fn last(mut self, value: impl AsRef<[u8]>) -> BytesMut {
        self.buf.put_slice(value.as_ref());
        self.buf
    }

    pub(crate) fn empty() -> BytesMut {
        BytesMut::new()
    }
}
