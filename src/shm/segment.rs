//! Named, file-backed memory segment.
//!
//! The segment is a regular file in a memory-backed directory (`/dev/shm` on
//! Linux, the temp directory elsewhere) mapped with `memmap2`. The creator
//! owns the name: it fails if the file already exists and removes it on drop.
//! Openers only unmap.
//!
//! All access goes through bounds-checked helpers; the base pointer never
//! leaves this module.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::MmapMut;

use crate::error::{RenderwireError, Result};

/// Directory holding segment files.
pub fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A mapped segment.
pub struct ShmSegment {
    map: MmapMut,
    base: *mut u8,
    len: usize,
    path: PathBuf,
    owner: bool,
    _file: File,
}

// The mapping is process-shared memory; every access below either goes
// through an atomic or happens while the cross-process lock is held.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create and zero a new segment of `size` bytes.
    ///
    /// Fails with `AlreadyExists` if a segment with this path is present.
    pub fn create(path: impl Into<PathBuf>, size: usize) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let segment = file
            .set_len(size as u64)
            .map_err(RenderwireError::from)
            .and_then(|_| Self::map(file, path.clone(), true));
        if segment.is_err() {
            let _ = std::fs::remove_file(&path);
        }
        segment
    }

    /// Open an existing segment; its size comes from the file length.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::map(file, path, false)
    }

    fn map(file: File, path: PathBuf, owner: bool) -> Result<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping and is
        // only resized by its creator before mapping.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let len = map.len();
        Ok(Self {
            map,
            base,
            len,
            path,
            owner,
            _file: file,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the segment (and will remove it).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RenderwireError::Truncated {
                needed: offset.saturating_add(len),
                available: self.len,
            }),
        }
    }

    /// Atomic view of a 4-byte aligned word.
    pub(super) fn u32_at(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "bad u32 offset {offset}");
        // SAFETY: in bounds and aligned (the mapping is page-aligned).
        unsafe { &*(self.base.add(offset) as *const AtomicU32) }
    }

    /// Atomic view of an 8-byte aligned word.
    pub(super) fn u64_at(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad u64 offset {offset}");
        // SAFETY: in bounds and aligned (the mapping is page-aligned).
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// Copy `data` into the segment at `offset`. Caller holds the lock.
    pub(super) fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked above; the region is not aliased by any Rust
        // reference and concurrent writers are excluded by the lock.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len()) };
        Ok(())
    }

    /// Copy `len` bytes out of the segment. Caller holds the lock.
    pub(super) fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked above.
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Flush dirty pages (no-op for memory-backed directories).
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "segment file already gone");
            }
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_create_open_share_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let creator = ShmSegment::create(&path, 4096).unwrap();
        let opener = ShmSegment::open(&path).unwrap();
        assert_eq!(opener.len(), 4096);
        assert!(creator.is_owner());
        assert!(!opener.is_owner());

        creator.u64_at(8).store(0xFEED, Ordering::Release);
        assert_eq!(opener.u64_at(8).load(Ordering::Acquire), 0xFEED);

        creator.write_bytes(100, b"abc").unwrap();
        assert_eq!(opener.read_bytes(100, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_create_fails_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let _first = ShmSegment::create(&path, 4096).unwrap();

        match ShmSegment::create(&path, 4096) {
            Err(RenderwireError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_creator_removes_file_opener_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let creator = ShmSegment::create(&path, 4096).unwrap();

        drop(ShmSegment::open(&path).unwrap());
        assert!(path.exists());

        drop(creator);
        assert!(!path.exists());
    }

    #[test]
    fn test_out_of_bounds_access_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let seg = ShmSegment::create(dir.path().join("seg"), 4096).unwrap();
        assert!(seg.write_bytes(4090, &[0u8; 8]).is_err());
        assert!(seg.read_bytes(usize::MAX, 2).is_err());
    }
}
