//! Shared-memory channel.
//!
//! A named segment split into a fixed header, a command half and a result
//! half. Writers seal payloads with a length and checksum; readers only see a
//! slot once its `ready` flag is published, and clear the flag once they have
//! consumed it.

mod channel;
mod header;
mod lock;
mod segment;

pub use channel::{SharedMemoryChannel, ShmStats, DEFAULT_COMMAND_FRACTION};
pub use header::{Slot, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use lock::DEFAULT_LOCK_TIMEOUT;
pub use segment::{default_segment_dir, ShmSegment};
