//! The mapped file: memory map, append, commit, flush, read-slice, teardown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, SegmentError};
use crate::mmap::MappedFile;
use crate::refcount::{Cleanup, RefCountedResource};
use crate::slice::ReadSlice;
use crate::staging::{StagingBuffer, StagingPool};

/// Page granularity used by the commit/flush threshold checks.
pub const OS_PAGE_SIZE: u64 = 4096;

static TOTAL_MAPPED_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_MAPPED_COUNT: AtomicU64 = AtomicU64::new(0);

/// Sum, over all live segments, of `fileSize` at successful `init`, minus
/// `fileSize` at successful cleanup.
pub fn total_mapped_bytes() -> u64 {
    TOTAL_MAPPED_BYTES.load(Ordering::Acquire)
}

/// Count of segments between a successful `init` and a successful cleanup.
pub fn total_mapped_count() -> u64 {
    TOTAL_MAPPED_COUNT.load(Ordering::Acquire)
}

/// Status of an `appendEncoded` call, mirroring the encoder's own framing
/// decisions (the segment never interprets `msg` itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Ok,
    EndOfFile,
    MessageSizeExceeded,
    UnknownError,
}

#[derive(Debug, Clone, Copy)]
pub struct AppendResult {
    pub wrote_bytes: u64,
    pub store_timestamp: u64,
    pub status: AppendStatus,
}

impl AppendResult {
    fn unknown_error(store_timestamp: u64) -> Self {
        Self {
            wrote_bytes: 0,
            store_timestamp,
            status: AppendStatus::UnknownError,
        }
    }
}

/// Encoder contract: lays a message out into `buffer`, starting logically at
/// `segment_from_offset + (fileSize - remaining)`, and reports how many bytes
/// it wrote.
pub trait AppendCallback<M: ?Sized> {
    fn do_append(
        &self,
        segment_from_offset: u64,
        buffer: &mut [u8],
        remaining: u64,
        msg: &M,
    ) -> AppendResult;
}

/// Whether `warm_up` forces the mapped region to disk as it touches pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmUpFlush {
    NoFlush,
    SyncFlush,
}

fn parse_file_from_offset(file_name: &str) -> Result<u64> {
    file_name
        .parse::<u64>()
        .map_err(|_| SegmentError::ArgumentRange("fileName is not a decimal byte offset"))
}

/// A single fixed-size, memory-mapped, append-only file.
pub struct Segment {
    path: PathBuf,
    file_name: String,
    file_size: u64,
    file_from_offset: u64,
    mapped: MappedFile,
    staging: Mutex<Option<StagingBuffer>>,
    has_staging: AtomicBool,
    pool: Option<Arc<dyn StagingPool>>,
    wrote_position: AtomicU64,
    committed_position: AtomicU64,
    flushed_position: AtomicU64,
    store_timestamp: AtomicU64,
    channel_dirty: AtomicBool,
    first_in_queue: AtomicBool,
    refcount: RefCountedResource,
}

impl Segment {
    /// Opens (creating and pre-sizing) the file at `path`, mapping the
    /// entire `[0, file_size)` region read/write. `fileFromOffset` is parsed
    /// from the basename. Fails with `IoFailure` if the file cannot be
    /// created, its parent directory cannot be made, or the mapping fails;
    /// any file handle opened along the way is closed by ordinary `Drop`
    /// before the error is returned. If `pool` is supplied but exhausted
    /// (`borrow` returns `None`), fails with `PoolExhausted` rather than
    /// silently falling back to an unstaged segment.
    pub fn init(
        path: impl AsRef<Path>,
        file_size: u64,
        pool: Option<Arc<dyn StagingPool>>,
    ) -> Result<Arc<Self>> {
        if file_size == 0 {
            return Err(SegmentError::ArgumentRange("fileSize must be non-zero"));
        }
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(SegmentError::ArgumentRange("path has no file name"))?
            .to_string();
        let file_from_offset = parse_file_from_offset(&file_name)?;

        let staging = match &pool {
            Some(p) => match p.borrow(file_size as usize) {
                Some(buf) => Some(buf),
                None => return Err(SegmentError::PoolExhausted),
            },
            None => None,
        };

        let mapped = MappedFile::create(&path, file_size as usize)?;

        let has_staging = staging.is_some();

        TOTAL_MAPPED_BYTES.fetch_add(file_size, Ordering::AcqRel);
        TOTAL_MAPPED_COUNT.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "segment {file_name} initialized ({file_size} bytes, staging={has_staging})"
        );

        Ok(Arc::new(Self {
            path,
            file_name,
            file_size,
            file_from_offset,
            mapped,
            staging: Mutex::new(staging),
            has_staging: AtomicBool::new(has_staging),
            pool,
            wrote_position: AtomicU64::new(0),
            committed_position: AtomicU64::new(0),
            flushed_position: AtomicU64::new(0),
            store_timestamp: AtomicU64::new(0),
            channel_dirty: AtomicBool::new(false),
            first_in_queue: AtomicBool::new(false),
            refcount: RefCountedResource::new(),
        }))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn file_from_offset(&self) -> u64 {
        self.file_from_offset
    }

    pub fn wrote_position(&self) -> u64 {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> u64 {
        self.committed_position.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> u64 {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    pub fn first_in_queue(&self) -> bool {
        self.first_in_queue.load(Ordering::Acquire)
    }

    pub fn set_first_in_queue(&self, value: bool) {
        self.first_in_queue.store(value, Ordering::Release);
    }

    /// Largest offset at which data is safely visible to readers:
    /// `committedPosition` when a staging buffer is attached, else
    /// `wrotePosition`.
    pub fn read_position(&self) -> u64 {
        if self.has_staging.load(Ordering::Acquire) {
            self.committed_position.load(Ordering::Acquire)
        } else {
            self.wrote_position.load(Ordering::Acquire)
        }
    }

    pub(crate) fn mapped_slice(&self) -> &[u8] {
        self.mapped.as_slice()
    }

    pub(crate) fn refcount(&self) -> &RefCountedResource {
        &self.refcount
    }

    /// Carves a slice of the active buffer (staging if attached, else the
    /// mapped region) starting at `wrotePosition` and hands it to `callback`
    /// to encode `msg` into. Returns `UnknownError` without invoking the
    /// callback if the segment is already full.
    pub fn append_encoded<M: ?Sized>(
        &self,
        msg: &M,
        callback: &dyn AppendCallback<M>,
    ) -> AppendResult {
        let wrote = self.wrote_position.load(Ordering::Acquire);
        if wrote >= self.file_size {
            return AppendResult::unknown_error(self.store_timestamp());
        }
        let remaining = self.file_size - wrote;

        let result = if self.has_staging.load(Ordering::Acquire) {
            let mut guard = self.staging.lock().unwrap();
            match guard.as_mut() {
                Some(buf) => {
                    let slice = &mut buf.as_mut_slice()[wrote as usize..];
                    callback.do_append(self.file_from_offset, slice, remaining, msg)
                }
                None => AppendResult::unknown_error(self.store_timestamp()),
            }
        } else {
            let slice = unsafe { self.mapped.mut_slice_at(wrote as usize, remaining as usize) };
            callback.do_append(self.file_from_offset, slice, remaining, msg)
        };

        if result.wrote_bytes > 0 {
            self.wrote_position
                .store(wrote + result.wrote_bytes, Ordering::Release);
            self.store_timestamp
                .store(result.store_timestamp, Ordering::Release);
        }
        result
    }

    /// Convenience non-staged write: advances `wrotePosition` by `bytes.len()`
    /// only if the write through the file channel actually succeeds. Does
    /// not touch `storeTimestamp`.
    pub fn append_raw(&self, bytes: &[u8]) -> bool {
        let len = bytes.len() as u64;
        let wrote = self.wrote_position.load(Ordering::Acquire);
        if wrote + len > self.file_size {
            return false;
        }
        match self.mapped.write_at(wrote, bytes) {
            Ok(()) => {
                self.channel_dirty.store(true, Ordering::Release);
                self.wrote_position.store(wrote + len, Ordering::Release);
                true
            }
            Err(err) => {
                log::warn!("appendRaw failed for segment {}: {err}", self.file_name);
                false
            }
        }
    }

    fn should_commit(&self, min_pages: i64) -> bool {
        let wrote = self.wrote_position.load(Ordering::Acquire);
        if wrote == self.file_size {
            return true;
        }
        let committed = self.committed_position.load(Ordering::Acquire);
        if min_pages > 0 {
            (wrote / OS_PAGE_SIZE) as i64 - (committed / OS_PAGE_SIZE) as i64 >= min_pages
        } else {
            wrote > committed
        }
    }

    /// No-op when no staging buffer is attached. Otherwise copies
    /// `[committedPosition, wrotePosition)` from staging into the file
    /// channel and advances `committedPosition`, returning the buffer to its
    /// pool once both positions reach `fileSize`.
    pub fn commit(&self, min_pages: i64) -> u64 {
        if !self.has_staging.load(Ordering::Acquire) {
            return self.wrote_position.load(Ordering::Acquire);
        }

        if self.should_commit(min_pages) && self.refcount.hold() {
            let wrote = self.wrote_position.load(Ordering::Acquire);
            let committed = self.committed_position.load(Ordering::Acquire);
            let mut guard = self.staging.lock().unwrap();

            if wrote > committed {
                if let Some(buf) = guard.as_ref() {
                    let bytes = &buf.as_slice()[committed as usize..wrote as usize];
                    match self.mapped.write_at(committed, bytes) {
                        Ok(()) => self.committed_position.store(wrote, Ordering::Release),
                        Err(err) => log::warn!(
                            "commit failed to copy staging bytes for segment {}: {err}",
                            self.file_name
                        ),
                    }
                }
            }

            let committed_now = self.committed_position.load(Ordering::Acquire);
            if wrote == self.file_size && committed_now == self.file_size {
                if let Some(buf) = guard.take() {
                    self.has_staging.store(false, Ordering::Release);
                    if let Some(pool) = &self.pool {
                        pool.give_back(buf);
                    }
                }
            }

            drop(guard);
            self.refcount.release(self);
        }

        self.committed_position.load(Ordering::Acquire)
    }

    fn should_flush(&self, min_pages: i64) -> bool {
        let read_pos = self.read_position();
        let flushed = self.flushed_position.load(Ordering::Acquire);
        if read_pos == self.file_size && flushed != self.file_size {
            return true;
        }
        if min_pages > 0 {
            (read_pos / OS_PAGE_SIZE) as i64 - (flushed / OS_PAGE_SIZE) as i64 >= min_pages
        } else {
            read_pos > flushed
        }
    }

    /// Forces durable storage of bytes up to `readPosition`. If `hold` fails
    /// because the segment is shutting down, still advances
    /// `flushedPosition` to `readPosition` without forcing — a best-effort
    /// finalization during the teardown race window.
    pub fn flush(&self, min_pages: i64) -> u64 {
        if self.should_flush(min_pages) {
            if self.refcount.hold() {
                let v = self.read_position();
                let result = if self.has_staging.load(Ordering::Acquire)
                    || self.channel_dirty.load(Ordering::Acquire)
                {
                    self.mapped.force_channel()
                } else {
                    self.mapped.force()
                };
                if let Err(err) = result {
                    log::warn!("flush failed for segment {}: {err}", self.file_name);
                }
                self.flushed_position.store(v, Ordering::Release);
                self.refcount.release(self);
            } else {
                self.flushed_position
                    .store(self.read_position(), Ordering::Release);
            }
        }
        self.flushed_position.load(Ordering::Acquire)
    }

    /// Returns a zero-copy view of `[pos, pos+size)`. Preconditions:
    /// `pos + size <= readPosition`. Holds a reference against the segment
    /// until the slice is dropped; returns `None` if the segment refuses the
    /// hold (shutting down) or the range is out of bounds.
    pub fn select_slice(self: &Arc<Self>, pos: u64, size: u64) -> Option<ReadSlice> {
        let read_pos = self.read_position();
        let in_range = pos
            .checked_add(size)
            .map(|end| end <= read_pos)
            .unwrap_or(false);
        if !in_range {
            log::warn!(
                "selectSlice out of range for segment {}: pos={pos} size={size} readPosition={read_pos}",
                self.file_name
            );
            return None;
        }
        if !self.refcount.hold() {
            return None;
        }
        Some(ReadSlice {
            segment: Arc::clone(self),
            start_offset: self.file_from_offset + pos,
            relative_pos: pos as usize,
            len: size as usize,
        })
    }

    /// Single-argument form: `[pos, readPosition)`.
    pub fn select_slice_to_end(self: &Arc<Self>, pos: u64) -> Option<ReadSlice> {
        let read_pos = self.read_position();
        if pos >= read_pos {
            log::warn!(
                "selectSlice out of range for segment {}: pos={pos} readPosition={read_pos}",
                self.file_name
            );
            return None;
        }
        self.select_slice(pos, read_pos - pos)
    }

    /// Touches one byte per OS page to fault the mapping in, optionally
    /// forcing every `pages_between_flushes` pages and yielding every 1000
    /// pages to avoid a long uninterruptible loop. Always ends by calling
    /// `mlock`.
    pub fn warm_up(&self, flush: WarmUpFlush, pages_between_flushes: u64) {
        let page_size = OS_PAGE_SIZE as usize;
        let mut pages_touched: u64 = 0;
        let mut offset = 0usize;
        while offset < self.file_size as usize {
            unsafe {
                let ptr = self.mapped.mut_slice_at(offset, 1);
                let byte = std::ptr::read_volatile(ptr.as_ptr());
                std::ptr::write_volatile(ptr.as_mut_ptr(), byte);
            }
            pages_touched += 1;

            if flush == WarmUpFlush::SyncFlush
                && pages_between_flushes > 0
                && pages_touched % pages_between_flushes == 0
            {
                if let Err(err) = self.mapped.force() {
                    log::warn!("warmUp flush failed for segment {}: {err}", self.file_name);
                }
            }
            if pages_touched % 1000 == 0 {
                std::thread::yield_now();
            }
            offset += page_size;
        }

        if flush == WarmUpFlush::SyncFlush {
            if let Err(err) = self.mapped.force() {
                log::warn!("warmUp final flush failed for segment {}: {err}", self.file_name);
            }
        }
        self.mlock();
    }

    /// Issues `mlock` + `madvise(WILLNEED)` on the mapped region. Failures
    /// are logged and swallowed; the segment remains functional without the
    /// hint.
    pub fn mlock(&self) {
        if let Err(err) = self.mapped.mlock() {
            log::warn!("mlock failed for segment {}: {err}", self.file_name);
        }
    }

    pub fn munlock(&self) {
        if let Err(err) = self.mapped.munlock() {
            log::warn!("munlock failed for segment {}: {err}", self.file_name);
        }
    }

    /// Requests shutdown, then closes the file handle and deletes the file
    /// once cleanup has completed. Returns `false` (and leaves the file in
    /// place) if a live reader is still holding a reference; the caller may
    /// retry.
    pub fn destroy(self: &Arc<Self>, interval_forcibly: Duration) -> bool {
        self.refcount.shutdown(self.as_ref(), interval_forcibly);
        if !self.refcount.is_cleanup_over() {
            return false;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::error!(
                    "failed to delete segment file {}: {err}",
                    self.path.display()
                );
            }
        }
        true
    }
}

impl Cleanup for Segment {
    /// Invoked by `RefCountedResource` once the refcount has drained and the
    /// segment has been marked unavailable. Advances the process-wide
    /// counters exactly once; the actual unmap and file-handle close happen
    /// through ordinary `Drop` once the last `Arc<Segment>` is released.
    fn cleanup(&self, _current_ref: i64) -> bool {
        if self.refcount.is_available() {
            log::warn!(
                "cleanup invoked on segment {} while still available; refusing",
                self.file_name
            );
            return false;
        }
        if self.refcount.cleanup_done() {
            return true;
        }
        TOTAL_MAPPED_BYTES.fetch_sub(self.file_size, Ordering::AcqRel);
        TOTAL_MAPPED_COUNT.fetch_sub(1, Ordering::AcqRel);
        log::debug!(
            "segment {} cleaned up ({} bytes released)",
            self.file_name,
            self.file_size
        );
        true
    }
}
