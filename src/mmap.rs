//! Thin wrapper over a whole-file read/write memory mapping.
//!
//! Mirrors the teacher's `MmapFile`: a `File` and its `MmapMut` kept side by
//! side, since writes issued through the file descriptor (`write_at`) and
//! writes issued through the mapping land on the same backing pages.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, SegmentError};

pub struct MappedFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MappedFile {
    /// Creates the parent directory if needed, then creates and maps a fresh
    /// file of exactly `len` bytes.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(SegmentError::ArgumentRange("fileSize must be non-zero"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Returns a mutable view of `[offset, offset+len)`, bypassing the usual
    /// `&mut self` borrow. Safe under the single-appender invariant: callers
    /// must ensure no other writer touches the same range concurrently.
    pub unsafe fn mut_slice_at(&self, offset: usize, len: usize) -> &mut [u8] {
        let ptr = self.map.as_ptr() as *mut u8;
        std::slice::from_raw_parts_mut(ptr.add(offset), len)
    }

    /// Positional write through the file descriptor. On a `MAP_SHARED`
    /// mapping this is visible through `as_slice` immediately, since both
    /// paths address the same page-cache pages.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.write_at(bytes, offset)?;
        Ok(())
    }

    /// Forces the mapped region to the backing device (`msync`).
    pub fn force(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Forces file-descriptor writes to the backing device without
    /// necessarily updating file metadata (`fdatasync`), matching the
    /// source's `force(false)`.
    pub fn force_channel(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn mlock(&self) -> Result<()> {
        let ptr = self.map.as_ptr() as *const libc::c_void;
        if unsafe { libc::mlock(ptr, self.len) } != 0 {
            return Err(SegmentError::IoFailure(std::io::Error::last_os_error()));
        }
        if unsafe { libc::madvise(ptr as *mut libc::c_void, self.len, libc::MADV_WILLNEED) } != 0 {
            return Err(SegmentError::IoFailure(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn munlock(&self) -> Result<()> {
        let ptr = self.map.as_ptr() as *const libc::c_void;
        if unsafe { libc::munlock(ptr, self.len) } != 0 {
            return Err(SegmentError::IoFailure(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_maps_exact_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000");
        let mapped = MappedFile::create(&path, 4096).unwrap();
        assert_eq!(mapped.len(), 4096);
        assert_eq!(mapped.as_slice().len(), 4096);
    }

    #[test]
    fn write_at_is_visible_through_mapping() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let mapped = MappedFile::create(&path, 4096).unwrap();
        mapped.write_at(0, b"hello").unwrap();
        assert_eq!(&mapped.as_slice()[0..5], b"hello");
    }

    #[test]
    fn rejects_zero_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        assert!(matches!(
            MappedFile::create(&path, 0),
            Err(SegmentError::ArgumentRange(_))
        ));
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("seg");
        let mapped = MappedFile::create(&path, 1024).unwrap();
        assert_eq!(mapped.len(), 1024);
    }
}
