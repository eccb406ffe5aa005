//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 36 bytes
//! - `WaitingForPayload`: Header validated, need N more payload bytes
//!
//! A frame is only yielded after its payload checksum matches. A checksum
//! failure consumes the bad frame and leaves the buffer aligned on the next
//! one; bad magic or an oversized payload leaves the stream unusable.

use bytes::BytesMut;

use super::codec::checksum;
use super::wire_format::{MessageHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{RenderwireError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: MessageHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 16 MiB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Append raw bytes from a socket read.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Stops at the first error; frames extracted before it are dropped, so
    /// stream readers should prefer [`extend`](Self::extend) plus
    /// [`next_frame`](Self::next_frame).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single verified frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(ChecksumMismatch)` if the frame was corrupt (already consumed)
    /// - `Err(Protocol)` on bad magic, unknown type or oversized payload
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match MessageHeader::decode(&self.buffer) {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    header.validate(self.max_payload_size)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let header = *header;
                    let size = header.data_size as usize;
                    if self.buffer.len() < size {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(size).freeze();
                    self.state = State::WaitingForHeader;

                    let actual = checksum(&payload);
                    if actual != header.checksum {
                        return Err(RenderwireError::ChecksumMismatch {
                            expected: header.checksum,
                            actual,
                        });
                    }
                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, MessageType};
    use bytes::Bytes;

    fn make_frame_bytes(id: u64, payload: &'static [u8]) -> Vec<u8> {
        let frame = Frame::with_payload(MessageType::Command, id, Bytes::from_static(payload));
        build_frame(&frame.header, frame.payload())
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_id(), 42);
        assert_eq!(frames[0].payload(), b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = make_frame_bytes(1, b"first");
        combined.extend_from_slice(&make_frame_bytes(2, b"second"));
        combined.extend_from_slice(&make_frame_bytes(3, b""));

        let frames = buffer.push(&combined).unwrap();

        let ids: Vec<u64> = frames.iter().map(|f| f.message_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(42, b"this payload arrives in pieces");

        assert!(buffer.push(&bytes[..10]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        assert!(buffer.push(&bytes[10..HEADER_SIZE + 4]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&bytes[HEADER_SIZE + 4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"this payload arrives in pieces");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut all_frames = Vec::new();
        for byte in make_frame_bytes(5, b"hi") {
            all_frames.extend(buffer.push(&[byte]).unwrap());
        }
        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].payload(), b"hi");
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = MessageHeader::new(MessageType::Command, 1, 1000, 0, 0);

        let result = buffer.push(&header.encode());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = make_frame_bytes(1, b"x");
        bytes[0] = b'X';
        assert!(matches!(
            buffer.push(&bytes),
            Err(RenderwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_skips_frame() {
        let mut buffer = FrameBuffer::new();
        let mut corrupt = make_frame_bytes(1, b"payload");
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        buffer.extend(&corrupt);
        buffer.extend(&make_frame_bytes(2, b"payload"));

        assert!(matches!(
            buffer.next_frame(),
            Err(RenderwireError::ChecksumMismatch { .. })
        ));
        let next = buffer.next_frame().unwrap().unwrap();
        assert_eq!(next.message_id(), 2);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(1, b"test");
        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }
}
