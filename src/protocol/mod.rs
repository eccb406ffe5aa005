//! Protocol module - data model, payload codec and reliable-channel framing.
//!
//! This module implements the binary protocol shared by both channels:
//! - Command / Result types with stable numeric codes
//! - Big-endian payload codec with xxh32 checksums and sealed envelopes
//! - 36-byte `MessageHeader` encoding/decoding
//! - Frame buffer for accumulating partial stream reads

mod codec;
mod frame;
mod frame_buffer;
mod types;
mod wire_format;

pub use codec::{
    checksum, decode_command, decode_result, encode_command, encode_result, open_command,
    open_result, open_sealed, seal, seal_command, seal_result, ENVELOPE_HEADER_SIZE,
};
pub use frame::{build_frame, build_frame_parts, Frame};
pub use frame_buffer::FrameBuffer;
pub use types::{
    now_millis, BackendKind, Color, Command, CommandKind, ContentParameters, ContentSourceKind,
    Rect, RenderProperties, RenderResult, ResultStatus, SurfaceHandle,
};
pub use wire_format::{
    MessageHeader, MessageType, DEFAULT_MAX_PAYLOAD_SIZE, FRAME_MAGIC, HEADER_SIZE,
};
