//! Revision words: the per-slot sequence counter readers poll
//!
//! A revision is a signed 64-bit word living in shared memory. The sign bit
//! is the write lock; the remaining bits hold the last committed revision.
//! Writers set the sign bit, mutate the slot, then publish the next revision
//! with release ordering. Readers load the word before and after copying.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Result;

use super::spin::{Backoff, SpinPolicy};

/// Revision number type for strong typing
pub type Revision = i64;

/// Special revision values
pub mod special {
    use super::Revision;

    /// Slot has never been written
    pub const UNWRITTEN: Revision = 0;
    /// First revision published by a write
    pub const FIRST: Revision = 1;
    /// Sign bit, set while a writer holds the slot
    pub const LOCK_BIT: Revision = Revision::MIN;
    /// Largest committed revision before wrapping
    pub const MAX: Revision = Revision::MAX;
}

/// Check if a raw revision word has the write lock set
#[inline]
pub fn is_locked(rev: Revision) -> bool {
    rev < 0
}

/// Check if a committed revision denotes a written slot
#[inline]
pub fn is_written(rev: Revision) -> bool {
    rev > special::UNWRITTEN
}

/// Strip the lock bit from a raw revision word
#[inline]
pub fn committed(rev: Revision) -> Revision {
    rev & special::MAX
}

/// Revision to publish after `rev`; wraps past `MAX` to `FIRST`, never to 0
#[inline]
pub fn next_revision(rev: Revision) -> Revision {
    match committed(rev).wrapping_add(1) & special::MAX {
        special::UNWRITTEN => special::FIRST,
        next => next,
    }
}

/// Atomic revision word as laid out in a record slot
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicRevision {
    value: AtomicI64,
}

impl AtomicRevision {
    /// Create a new revision word starting at UNWRITTEN
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(special::UNWRITTEN),
        }
    }

    /// Create a revision word with an initial value
    pub const fn with_initial(initial: Revision) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// View a shared-memory word as a revision.
    ///
    /// # Safety
    /// `ptr` must be 8-byte aligned and valid for the lifetime `'a`.
    pub unsafe fn from_ptr<'a>(ptr: *const i64) -> &'a Self {
        &*(ptr as *const Self)
    }

    /// Load the raw word with acquire ordering
    #[inline]
    pub fn load_acquire(&self) -> Revision {
        self.value.load(Ordering::Acquire)
    }

    /// Load the raw word with relaxed ordering
    #[inline]
    pub fn load_relaxed(&self) -> Revision {
        self.value.load(Ordering::Relaxed)
    }

    /// Wait until no writer holds the word and return the observed revision
    pub fn read_lock(&self, policy: &SpinPolicy, operation: &str) -> Result<Revision> {
        let mut backoff = Backoff::new(policy);
        loop {
            let rev = self.load_acquire();
            if !is_locked(rev) {
                return Ok(rev);
            }
            backoff.snooze(operation)?;
        }
    }

    /// Set the lock bit, waiting out any other holder.
    ///
    /// Returns the committed revision that was current when the lock was taken.
    pub fn write_lock(&self, policy: &SpinPolicy, operation: &str) -> Result<Revision> {
        let mut backoff = Backoff::new(policy);
        loop {
            let rev = self.value.fetch_or(special::LOCK_BIT, Ordering::AcqRel);
            if !is_locked(rev) {
                return Ok(rev);
            }
            backoff.snooze(operation)?;
        }
    }

    /// Publish `rev`, releasing the lock
    #[inline]
    pub fn unlock(&self, rev: Revision) {
        self.value.store(rev, Ordering::Release);
    }

    /// Clear a lock bit left behind by a writer that died mid-update.
    ///
    /// Returns true if a stale lock was found.
    pub fn clear_stale_lock(&self) -> bool {
        let rev = self.value.fetch_and(special::MAX, Ordering::AcqRel);
        is_locked(rev)
    }
}

impl Default for AtomicRevision {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_revision_states() {
        assert!(!is_written(special::UNWRITTEN));
        assert!(is_written(special::FIRST));
        assert!(is_locked(special::LOCK_BIT | 5));
        assert_eq!(committed(special::LOCK_BIT | 5), 5);
    }

    #[test]
    fn test_next_revision_skips_zero() {
        assert_eq!(next_revision(special::UNWRITTEN), 1);
        assert_eq!(next_revision(41), 42);
        assert_eq!(next_revision(special::LOCK_BIT | 41), 42);
        assert_eq!(next_revision(special::MAX), special::FIRST);
    }

    #[test]
    fn test_lock_and_unlock() {
        let word = AtomicRevision::new();
        let policy = SpinPolicy::default();

        let old = word.write_lock(&policy, "test").unwrap();
        assert_eq!(old, special::UNWRITTEN);
        assert!(is_locked(word.load_relaxed()));

        word.unlock(next_revision(old));
        assert_eq!(word.read_lock(&policy, "test").unwrap(), 1);
    }

    #[test]
    fn test_read_lock_gives_up() {
        let word = AtomicRevision::with_initial(special::LOCK_BIT | 3);
        let policy = SpinPolicy::new(10, Duration::from_micros(100), Duration::from_millis(2));

        let err = word.read_lock(&policy, "stuck").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::WouldBlock);
        assert!(word.clear_stale_lock());
        assert_eq!(word.load_relaxed(), 3);
        assert!(!word.clear_stale_lock());
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let word = Arc::new(AtomicRevision::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let word = word.clone();
                thread::spawn(move || {
                    let policy = SpinPolicy::default();
                    for _ in 0..500 {
                        let old = word.write_lock(&policy, "increment").unwrap();
                        word.unlock(next_revision(old));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(word.load_relaxed(), 2000);
    }
}
