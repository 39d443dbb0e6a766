//! Optional off-heap write buffer attached to a `Segment`.
//!
//! The pool itself (loan/return bookkeeping, sizing policy) is an external
//! collaborator; this module only describes the contract a segment needs
//! from it and the borrowed buffer's shape.

/// A borrowed buffer of exactly the segment's `fileSize`, usable for writes
/// until it is handed back to the pool it came from.
pub struct StagingBuffer {
    bytes: Box<[u8]>,
}

impl StagingBuffer {
    pub fn new(bytes: Box<[u8]>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Loans and reclaims `StagingBuffer`s of a requested length. A segment
/// borrows at most one buffer for its lifetime and returns it exactly once,
/// either on a full commit or when the queue manager force-returns it at
/// teardown.
pub trait StagingPool: Send + Sync {
    /// Loans a buffer of at least `len` bytes, or `None` if the pool is
    /// exhausted.
    fn borrow(&self, len: usize) -> Option<StagingBuffer>;

    /// Returns a previously borrowed buffer.
    fn give_back(&self, buf: StagingBuffer);
}
