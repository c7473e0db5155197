//! Protocol error types.

use thiserror::Error;

/// Result type for packet and codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The type ordinal does not name a known packet.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    /// The magic is neither REQUEST nor RESPONSE.
    #[error("Unknown packet magic: {0:#010x}")]
    UnknownMagic(u32),

    /// A NUL-terminated field was expected but the payload ended.
    #[error("Packet {packet} is missing field '{field}'")]
    MissingField { packet: &'static str, field: &'static str },

    /// A numeric field did not parse.
    #[error("Packet {packet} has an invalid number in '{field}': {value}")]
    InvalidNumber {
        packet: &'static str,
        field: &'static str,
        value: String,
    },

    /// A text field was not valid UTF-8.
    #[error("Packet {packet} has non UTF-8 data in '{field}'")]
    InvalidUtf8 { packet: &'static str, field: &'static str },

    /// Declared payload length exceeds the configured maximum.
    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// A text command grew past the configured maximum without a line feed.
    #[error("Text command exceeds the {max} byte limit")]
    LineTooLong { max: usize },

    /// The stream ended in the middle of a frame.
    #[error("Stream closed with {remaining} bytes of an incomplete frame")]
    Truncated { remaining: usize },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true if the connection can no longer stay framed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PayloadTooLarge { .. }
                | ProtocolError::LineTooLong { .. }
                | ProtocolError::Truncated { .. }
                | ProtocolError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::PayloadTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(ProtocolError::Truncated { remaining: 3 }.is_fatal());
        assert!(!ProtocolError::UnknownPacketType(5).is_fatal());
        assert!(!ProtocolError::MissingField {
            packet: "SUBMIT_JOB",
            field: "unique_id"
        }
        .is_fatal());
    }

    #[test]
    fn test_display_magic_is_hex() {
        let msg = ProtocolError::UnknownMagic(0x0052_4551).to_string();
        assert!(msg.contains("0x00524551"));
    }
}
