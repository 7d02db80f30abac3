//! Record slots guarded by a single-writer sequence lock
//!
//! Slot layout in shared memory:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────────────┐
//! │ revision: i64    │ timestamp: i64   │ value: value_size bytes     │
//! │ (lock = sign bit)│ (microseconds)   │ (padded to 8 bytes)         │
//! └──────────────────┴──────────────────┴─────────────────────────────┘
//! ```
//!
//! Readers never block the writer: a read copies the value between two
//! loads of the revision word and retries if they differ or the lock bit
//! was set. The cost of contention is a retried copy, never a stall.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, Ordering};

use crate::{
    clock::Microsec,
    error::{Result, StoreError},
};

use super::{
    sequence::{is_locked, next_revision, special, AtomicRevision, Revision},
    spin::{Backoff, SpinPolicy},
};

/// Byte offset of the revision word within a slot
pub const REVISION_OFFSET: usize = 0;
/// Byte offset of the write timestamp within a slot
pub const TIMESTAMP_OFFSET: usize = 8;
/// Byte offset of the value payload within a slot
pub const VALUE_OFFSET: usize = 16;

/// Outcome of a consistent slot read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRead {
    /// Revision the copied value belongs to
    pub revision: Revision,
    /// Writer's timestamp for that revision
    pub timestamp: Microsec,
}

/// A view of one record slot inside a mapped segment
pub struct RecordSlot<'a> {
    id: i64,
    revision: &'a AtomicRevision,
    timestamp: &'a AtomicI64,
    value: NonNull<u8>,
    value_size: usize,
    writable: bool,
    _segment: PhantomData<&'a [u8]>,
}

// Slot memory is shared across processes; all access goes through the revision protocol.
unsafe impl Send for RecordSlot<'_> {}
unsafe impl Sync for RecordSlot<'_> {}

impl std::fmt::Debug for RecordSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSlot")
            .field("id", &self.id)
            .field("revision", &self.revision.load_relaxed())
            .field("value_size", &self.value_size)
            .finish()
    }
}

impl<'a> RecordSlot<'a> {
    /// Build a slot view from its base address.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and valid for `VALUE_OFFSET + value_size`
    /// bytes for `'a`. If `writable` is true the memory must be writable.
    pub unsafe fn from_raw(id: i64, base: *mut u8, value_size: usize, writable: bool) -> Self {
        Self {
            id,
            revision: AtomicRevision::from_ptr(base.add(REVISION_OFFSET) as *const i64),
            timestamp: &*(base.add(TIMESTAMP_OFFSET) as *const AtomicI64),
            value: NonNull::new_unchecked(base.add(VALUE_OFFSET)),
            value_size,
            writable,
            _segment: PhantomData,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Raw revision word, lock bit included
    pub fn raw_revision(&self) -> Revision {
        self.revision.load_acquire()
    }

    /// Copy a consistent value into `dest`.
    ///
    /// Fails with `RecordNotFound` if the slot was never written and with
    /// `WouldBlock` if the spin budget runs out on a wedged writer.
    pub fn read(&self, dest: &mut [u8], policy: &SpinPolicy) -> Result<SlotRead> {
        if dest.len() != self.value_size {
            return Err(StoreError::short_buffer(self.value_size, dest.len()));
        }

        let mut backoff = Backoff::new(policy);
        loop {
            let before = self.revision.read_lock(policy, "read_record")?;
            if before == special::UNWRITTEN {
                return Err(StoreError::record_not_found(self.id));
            }

            let timestamp = self.timestamp.load(Ordering::Relaxed);
            unsafe {
                std::ptr::copy_nonoverlapping(self.value.as_ptr(), dest.as_mut_ptr(), self.value_size);
            }

            fence(Ordering::Acquire);
            if self.revision.load_relaxed() == before {
                return Ok(SlotRead {
                    revision: before,
                    timestamp,
                });
            }

            // stomped mid-copy
            backoff.snooze("read_record")?;
        }
    }

    /// Read only the revision and timestamp, consistently
    pub fn read_meta(&self, policy: &SpinPolicy) -> Result<SlotRead> {
        let mut backoff = Backoff::new(policy);
        loop {
            let before = self.revision.read_lock(policy, "read_meta")?;
            if before == special::UNWRITTEN {
                return Err(StoreError::record_not_found(self.id));
            }
            let timestamp = self.timestamp.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.revision.load_relaxed() == before {
                return Ok(SlotRead {
                    revision: before,
                    timestamp,
                });
            }
            backoff.snooze("read_meta")?;
        }
    }

    /// Lock, overwrite the value, publish the next revision.
    ///
    /// Size and writability are checked before the revision word is touched.
    pub fn write(&self, src: &[u8], timestamp: Microsec, policy: &SpinPolicy) -> Result<Revision> {
        if !self.writable {
            return Err(StoreError::read_only("write_record"));
        }
        if src.len() != self.value_size {
            return Err(StoreError::short_buffer(self.value_size, src.len()));
        }

        let old = self.revision.write_lock(policy, "write_record")?;
        fence(Ordering::Release);

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.value.as_ptr(), self.value_size);
        }
        self.timestamp.store(timestamp, Ordering::Relaxed);

        let new = next_revision(old);
        self.revision.unlock(new);
        Ok(new)
    }

    /// Return the slot to the never-written state
    pub fn clear(&self, policy: &SpinPolicy) -> Result<()> {
        if !self.writable {
            return Err(StoreError::read_only("clear_record"));
        }

        self.revision.write_lock(policy, "clear_record")?;
        fence(Ordering::Release);

        unsafe {
            std::ptr::write_bytes(self.value.as_ptr(), 0, self.value_size);
        }
        self.timestamp.store(0, Ordering::Relaxed);
        self.revision.unlock(special::UNWRITTEN);
        Ok(())
    }

    /// Drop a lock bit left set by a writer that died mid-update
    pub fn recover(&self) -> bool {
        if !self.writable || !is_locked(self.revision.load_relaxed()) {
            return false;
        }
        self.revision.clear_stale_lock()
    }
}
