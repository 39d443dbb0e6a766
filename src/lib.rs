//! Core per-file storage primitive of an append-only, commit-log–style
//! message broker: a fixed-size, memory-mapped segment with sequential
//! append, dual-stage persistence (optional staging buffer → mapped region →
//! disk), zero-copy random reads, and a reference-counted teardown protocol.
//!
//! Out of scope here (external collaborators, used only at the interface
//! this crate needs from them): grouping segments into a logical log,
//! message encoding, staging-buffer pool policy, flush scheduling, and
//! anything downstream of a single segment file.

pub mod error;
pub mod mmap;
pub mod refcount;
pub mod segment;
pub mod slice;
pub mod staging;

pub use error::{Result, SegmentError};
pub use refcount::{Cleanup, RefCountedResource};
pub use segment::{
    total_mapped_bytes, total_mapped_count, AppendCallback, AppendResult, AppendStatus, Segment,
    WarmUpFlush, OS_PAGE_SIZE,
};
pub use slice::ReadSlice;
pub use staging::{StagingBuffer, StagingPool};
