//! Reliable-channel frame header.
//!
//! Implements the 36-byte header format:
//! ```text
//! ┌────────┬──────────┬────────────┬───────────┬──────────┬───────────┐
//! │ Magic  │ Msg type │ Message ID │ Data size │ Checksum │ Timestamp │
//! │ 4 bytes│ 4 bytes  │ 8 bytes    │ 8 bytes   │ 4 bytes  │ 8 bytes   │
//! │ u32 BE │ u32 BE   │ u64 BE     │ u64 BE    │ u32 BE   │ u64 BE    │
//! └────────┴──────────┴────────────┴───────────┴──────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{RenderwireError, Result};

/// Header size in bytes (fixed, exactly 36).
pub const HEADER_SIZE: usize = 36;

/// Frame magic, ASCII "REND".
pub const FRAME_MAGIC: u32 = 0x5245_4E44;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// Kind of message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command,
    Result,
    Heartbeat,
    Ack,
}

impl MessageType {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            MessageType::Command => 1,
            MessageType::Result => 2,
            MessageType::Heartbeat => 3,
            MessageType::Ack => 4,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(MessageType::Command),
            2 => Some(MessageType::Result),
            3 => Some(MessageType::Heartbeat),
            4 => Some(MessageType::Ack),
            _ => None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Must equal [`FRAME_MAGIC`].
    pub magic: u32,
    /// Raw message type code; see [`MessageHeader::message_type`].
    pub message_type: u32,
    /// Command id for commands and results, a sequence number otherwise.
    pub message_id: u64,
    /// Payload length in bytes.
    pub data_size: u64,
    /// xxh32 of the payload.
    pub checksum: u32,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
}

impl MessageHeader {
    /// Create a new header with the frame magic.
    pub fn new(
        message_type: MessageType,
        message_id: u64,
        data_size: u64,
        checksum: u32,
        timestamp: u64,
    ) -> Self {
        Self {
            magic: FRAME_MAGIC,
            message_type: message_type.code(),
            message_id,
            data_size,
            checksum,
            timestamp,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use renderwire::protocol::{MessageHeader, MessageType};
    ///
    /// let header = MessageHeader::new(MessageType::Command, 42, 100, 0, 0);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 36);
    /// assert_eq!(&bytes[0..4], b"REND");
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (36 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.message_type.to_be_bytes());
        buf[8..16].copy_from_slice(&self.message_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_be_bytes());
        buf[28..36].copy_from_slice(&self.timestamp.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. No validation is performed.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_be_bytes(b)
        };
        Some(Self {
            magic: u32_at(0),
            message_type: u32_at(4),
            message_id: u64_at(8),
            data_size: u64_at(16),
            checksum: u32_at(24),
            timestamp: u64_at(28),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Magic matches
    /// - Message type is known
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u64) -> Result<()> {
        if self.magic != FRAME_MAGIC {
            return Err(RenderwireError::Protocol(format!(
                "bad frame magic {:#010x}",
                self.magic
            )));
        }

        if MessageType::from_code(self.message_type).is_none() {
            return Err(RenderwireError::Protocol(format!(
                "unknown message type {}",
                self.message_type
            )));
        }

        if self.data_size > max_payload_size {
            return Err(RenderwireError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.data_size, max_payload_size
            )));
        }

        Ok(())
    }

    /// Typed message type, `None` for unknown codes.
    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.message_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = MessageHeader::new(MessageType::Result, 42, 100, 0xCAFE_BABE, 1234);
        let encoded = original.encode();
        let decoded = MessageHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = MessageHeader::new(
            MessageType::Heartbeat,
            0x0102_0304_0506_0708,
            0x10,
            0x0A0B_0C0D,
            0x1112_1314_1516_1718,
        );
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[0x52, 0x45, 0x4E, 0x44]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 0, 0, 0, 0, 0x10]);
        assert_eq!(&bytes[24..28], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[28..36], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(MessageHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_bad_magic() {
        let mut header = MessageHeader::new(MessageType::Command, 1, 0, 0, 0);
        header.magic = 0x524D_5348;
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.to_string().contains("bad frame magic"));
    }

    #[test]
    fn test_validate_unknown_type() {
        let mut header = MessageHeader::new(MessageType::Command, 1, 0, 0, 0);
        header.message_type = 9;
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
        assert_eq!(header.message_type(), None);
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = MessageHeader::new(MessageType::Command, 1, 1_000_000, 0, 0);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }
}
