//! Layout of the 128-byte segment header.
//!
//! ```text
//! off  size  field
//!   0     4  magic            "RMSH"
//!   4     4  version          1
//!   8     8  command_capacity bytes in the command half
//!  16     8  command_size     envelope bytes in the command slot
//!  24     8  result_size      envelope bytes in the result slot
//!  32     4  command_ready    0/1
//!  36     4  result_ready     0/1
//!  40     8  command_sequence
//!  48     8  result_sequence
//!  56     4  lock word        owner pid, 0 when free
//!  60     4  command event    auto-reset flag
//!  64     4  result event     auto-reset flag
//!  68    60  reserved
//! ```
//!
//! Fields are native-endian atomics; both ends of a segment run on the same
//! machine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::segment::ShmSegment;

pub const SEGMENT_MAGIC: u32 = 0x524D_5348;
pub const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 128;

const MAGIC: usize = 0;
const VERSION: usize = 4;
const COMMAND_CAPACITY: usize = 8;
const COMMAND_SIZE: usize = 16;
const RESULT_SIZE: usize = 24;
const COMMAND_READY: usize = 32;
const RESULT_READY: usize = 36;
const COMMAND_SEQUENCE: usize = 40;
const RESULT_SEQUENCE: usize = 48;
const LOCK: usize = 56;
const COMMAND_EVENT: usize = 60;
const RESULT_EVENT: usize = 64;

/// One of the two single-message slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Command,
    Result,
}

impl Slot {
    pub fn name(self) -> &'static str {
        match self {
            Slot::Command => "command",
            Slot::Result => "result",
        }
    }
}

/// Typed accessors over the header words of a segment.
pub(super) struct Header<'a> {
    seg: &'a ShmSegment,
}

impl<'a> Header<'a> {
    pub fn new(seg: &'a ShmSegment) -> Self {
        Self { seg }
    }

    /// Write magic, version and split into a freshly zeroed segment.
    pub fn init(&self, command_capacity: u64) {
        self.seg.u32_at(VERSION).store(SEGMENT_VERSION, Ordering::Relaxed);
        self.seg
            .u64_at(COMMAND_CAPACITY)
            .store(command_capacity, Ordering::Relaxed);
        // Magic last: an opener that sees it also sees the rest.
        self.seg.u32_at(MAGIC).store(SEGMENT_MAGIC, Ordering::Release);
    }

    pub fn magic(&self) -> u32 {
        self.seg.u32_at(MAGIC).load(Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.seg.u32_at(VERSION).load(Ordering::Acquire)
    }

    pub fn command_capacity(&self) -> u64 {
        self.seg.u64_at(COMMAND_CAPACITY).load(Ordering::Acquire)
    }

    pub fn lock_word(&self) -> &'a AtomicU32 {
        self.seg.u32_at(LOCK)
    }

    pub fn size(&self, slot: Slot) -> &'a AtomicU64 {
        self.seg.u64_at(match slot {
            Slot::Command => COMMAND_SIZE,
            Slot::Result => RESULT_SIZE,
        })
    }

    pub fn ready(&self, slot: Slot) -> &'a AtomicU32 {
        self.seg.u32_at(match slot {
            Slot::Command => COMMAND_READY,
            Slot::Result => RESULT_READY,
        })
    }

    pub fn sequence(&self, slot: Slot) -> &'a AtomicU64 {
        self.seg.u64_at(match slot {
            Slot::Command => COMMAND_SEQUENCE,
            Slot::Result => RESULT_SEQUENCE,
        })
    }

    pub fn event(&self, slot: Slot) -> &'a AtomicU32 {
        self.seg.u32_at(match slot {
            Slot::Command => COMMAND_EVENT,
            Slot::Result => RESULT_EVENT,
        })
    }
}
