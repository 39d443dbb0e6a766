//! Shared lifetime with deferred cleanup under live readers.
//!
//! A generic primitive, not specific to segments: any object whose backing
//! OS resources must outlive concurrent borrowers can embed a
//! `RefCountedResource` and implement `Cleanup` to describe how it tears
//! itself down exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Hook invoked by `RefCountedResource` once the refcount has dropped to zero
/// or below and the resource has been marked unavailable. Returns `true` once
/// teardown has actually completed; returning `false` lets the caller retry
/// later (used to refuse a cleanup attempted while still available).
pub trait Cleanup {
    fn cleanup(&self, current_ref: i64) -> bool;
}

/// Sentinel for `first_shutdown_nanos` meaning "shutdown not yet requested".
const NOT_SHUTDOWN: u64 = u64::MAX;

pub struct RefCountedResource {
    available: AtomicBool,
    refcount: AtomicI64,
    cleanup_done: AtomicBool,
    /// Fixed at construction; never mutated, so reading it needs no
    /// synchronization of its own. Used only to convert `Instant::now()` into
    /// a nanosecond count that `first_shutdown_nanos` can store atomically.
    epoch: Instant,
    first_shutdown_nanos: AtomicU64,
}

impl Default for RefCountedResource {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCountedResource {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            refcount: AtomicI64::new(1),
            cleanup_done: AtomicBool::new(false),
            epoch: Instant::now(),
            first_shutdown_nanos: AtomicU64::new(NOT_SHUTDOWN),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn cleanup_done(&self) -> bool {
        self.cleanup_done.load(Ordering::Acquire)
    }

    /// Increments the refcount iff the resource is still available. The
    /// availability check happens-before the increment, and the increment
    /// happens-before anything the holder subsequently reads from the
    /// resource.
    pub fn hold(&self) -> bool {
        if !self.available.load(Ordering::Acquire) {
            return false;
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Decrements the refcount; runs cleanup at most once if the decrement
    /// brings it to zero or below while the resource is unavailable.
    pub fn release<C: Cleanup>(&self, owner: &C) {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        let current = previous - 1;
        if current <= 0 && !self.available.load(Ordering::Acquire) {
            self.try_cleanup(owner, current);
        }
    }

    fn try_cleanup<C: Cleanup>(&self, owner: &C, current_ref: i64) {
        if self.cleanup_done.load(Ordering::Acquire) {
            return;
        }
        if owner.cleanup(current_ref) {
            self.cleanup_done.store(true, Ordering::Release);
        }
    }

    /// Requests shutdown. The first call flips `available` and releases the
    /// owner's initial reference. Subsequent calls, once unavailable, check
    /// whether `interval_forcibly` has elapsed since the first request and,
    /// if so, forcibly zero the refcount and attempt cleanup regardless of
    /// outstanding holders.
    pub fn shutdown<C: Cleanup>(&self, owner: &C, interval_forcibly: Duration) {
        if self
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let now_nanos = self.epoch.elapsed().as_nanos() as u64;
            self.first_shutdown_nanos.store(now_nanos, Ordering::Release);
            self.release(owner);
            return;
        }

        if self.refcount.load(Ordering::Acquire) > 0 {
            let first_nanos = self.first_shutdown_nanos.load(Ordering::Acquire);
            if first_nanos != NOT_SHUTDOWN {
                let now_nanos = self.epoch.elapsed().as_nanos() as u64;
                let elapsed = Duration::from_nanos(now_nanos.saturating_sub(first_nanos));
                if elapsed >= interval_forcibly {
                    self.refcount.store(0, Ordering::Release);
                    self.try_cleanup(owner, 0);
                }
            }
        }
    }

    pub fn is_cleanup_over(&self) -> bool {
        self.cleanup_done.load(Ordering::Acquire) && self.refcount.load(Ordering::Acquire) <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingOwner {
        cleaned: Cell<bool>,
    }

    impl Cleanup for CountingOwner {
        fn cleanup(&self, _current_ref: i64) -> bool {
            self.cleaned.set(true);
            true
        }
    }

    #[test]
    fn hold_fails_once_unavailable() {
        let res = RefCountedResource::new();
        let owner = CountingOwner {
            cleaned: Cell::new(false),
        };
        assert!(res.hold());
        res.shutdown(&owner, Duration::from_secs(60));
        assert!(!res.is_available());
        assert!(!res.hold());
    }

    #[test]
    fn cleanup_runs_once_refcount_drains() {
        let res = RefCountedResource::new();
        let owner = CountingOwner {
            cleaned: Cell::new(false),
        };
        assert!(res.hold());
        res.shutdown(&owner, Duration::from_secs(60));
        assert!(!owner.cleaned.get());
        res.release(&owner);
        assert!(owner.cleaned.get());
        assert!(res.is_cleanup_over());
    }

    #[test]
    fn forcible_shutdown_ignores_live_holders() {
        let res = RefCountedResource::new();
        let owner = CountingOwner {
            cleaned: Cell::new(false),
        };
        assert!(res.hold());
        res.shutdown(&owner, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        res.shutdown(&owner, Duration::from_millis(0));
        assert!(owner.cleaned.get());
        assert!(res.is_cleanup_over());
    }
}
