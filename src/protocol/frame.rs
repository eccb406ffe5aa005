//! Frame struct with typed accessors.
//!
//! Represents a complete reliable-channel frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use renderwire::protocol::{Frame, MessageType};
//!
//! let frame = Frame::heartbeat(7);
//! assert_eq!(frame.message_type(), Some(MessageType::Heartbeat));
//! assert_eq!(frame.message_id(), 7);
//! assert!(frame.payload().is_empty());
//! ```

use bytes::Bytes;

use super::codec::{checksum, decode_command, decode_result, encode_command, encode_result};
use super::types::{now_millis, Command, RenderResult};
use super::wire_format::{MessageHeader, MessageType, HEADER_SIZE};
use crate::error::{RenderwireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: MessageHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: MessageHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Build a frame around a payload, filling in size, checksum and timestamp.
    pub fn with_payload(message_type: MessageType, message_id: u64, payload: Bytes) -> Self {
        let header = MessageHeader::new(
            message_type,
            message_id,
            payload.len() as u64,
            checksum(&payload),
            now_millis(),
        );
        Self { header, payload }
    }

    /// Frame carrying an encoded command; the message id is the command id.
    pub fn command(cmd: &Command) -> Result<Self> {
        Ok(Self::with_payload(
            MessageType::Command,
            cmd.id,
            encode_command(cmd)?,
        ))
    }

    /// Frame carrying an encoded result; the message id is the command id.
    pub fn result(result: &RenderResult) -> Result<Self> {
        Ok(Self::with_payload(
            MessageType::Result,
            result.command_id,
            encode_result(result)?,
        ))
    }

    /// Empty keep-alive frame.
    pub fn heartbeat(sequence: u64) -> Self {
        Self::with_payload(MessageType::Heartbeat, sequence, Bytes::new())
    }

    /// Empty acknowledgement of `message_id`.
    pub fn ack(message_id: u64) -> Self {
        Self::with_payload(MessageType::Ack, message_id, Bytes::new())
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Typed message type.
    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }

    /// Get the message ID.
    #[inline]
    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Decode the payload as a command.
    pub fn decode_command(&self) -> Result<Command> {
        self.expect_type(MessageType::Command)?;
        decode_command(&self.payload)
    }

    /// Decode the payload as a result.
    pub fn decode_result(&self) -> Result<RenderResult> {
        self.expect_type(MessageType::Result)?;
        decode_result(&self.payload)
    }

    fn expect_type(&self, expected: MessageType) -> Result<()> {
        match self.message_type() {
            Some(t) if t == expected => Ok(()),
            other => Err(RenderwireError::Protocol(format!(
                "expected {expected:?} frame, got {other:?}"
            ))),
        }
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer.
/// Use `build_frame_parts` for scatter/gather I/O (writev).
pub fn build_frame(header: &MessageHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Build frame parts for scatter/gather I/O.
///
/// Returns the encoded header and a reference to the payload.
pub fn build_frame_parts<'a>(
    header: &MessageHeader,
    payload: &'a [u8],
) -> ([u8; HEADER_SIZE], &'a [u8]) {
    (header.encode(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, ResultStatus};

    #[test]
    fn test_command_frame() {
        let mut cmd = Command::new(CommandKind::Render, 4);
        cmd.id = 11;
        let frame = Frame::command(&cmd).unwrap();

        assert_eq!(frame.message_type(), Some(MessageType::Command));
        assert_eq!(frame.message_id(), 11);
        assert_eq!(frame.header.data_size, frame.payload_len() as u64);
        assert_eq!(frame.header.checksum, checksum(frame.payload()));
        assert_eq!(frame.decode_command().unwrap(), cmd);
    }

    #[test]
    fn test_result_frame_wrong_decode() {
        let mut cmd = Command::new(CommandKind::Render, 4);
        cmd.id = 3;
        let result = RenderResult::failure(&cmd, ResultStatus::Failure, "boom");
        let frame = Frame::result(&result).unwrap();

        assert_eq!(frame.message_id(), 3);
        assert_eq!(frame.decode_result().unwrap(), result);
        assert!(matches!(
            frame.decode_command(),
            Err(RenderwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_control_frames_are_empty() {
        let hb = Frame::heartbeat(1);
        let ack = Frame::ack(99);
        assert_eq!(hb.payload_len(), 0);
        assert_eq!(hb.wire_len(), HEADER_SIZE);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.message_id(), 99);
    }

    #[test]
    fn test_build_frame() {
        let frame = Frame::with_payload(MessageType::Command, 42, Bytes::from_static(b"hello"));
        let bytes = build_frame(&frame.header, frame.payload());

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let parsed_header = MessageHeader::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed_header, frame.header);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_frame_parts() {
        let frame = Frame::with_payload(MessageType::Result, 1, Bytes::from_static(b"abc"));
        let (header_bytes, payload_ref) = build_frame_parts(&frame.header, frame.payload());

        assert_eq!(header_bytes.len(), HEADER_SIZE);
        assert_eq!(payload_ref, b"abc");
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let frame = Frame::with_payload(MessageType::Command, 456, Bytes::from_static(b"0123456789"));
        let bytes = build_frame(&frame.header, frame.payload());

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_id(), 456);
        assert_eq!(frames[0].payload(), b"0123456789");
    }
}
