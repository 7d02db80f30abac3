//! Change queue: a bounded ring of recently written record identifiers
//!
//! The writer appends the id of every record it writes, with the write
//! timestamp, at `head mod capacity` and then advances `head`. Tailing
//! readers compare `head` with the position they last consumed. The queue
//! only says *which* id changed; readers re-read the slot to get the value,
//! so several entries for the same id coalesce to its latest value. At least
//! the most recent `capacity` changes are visible; a reader that falls
//! further behind loses the oldest ones (an overrun).
//!
//! Before touching a ring element the writer bumps `claimed` to the position
//! it is filling plus one. A reader that copied entries re-checks `claimed`
//! afterwards: every position below `claimed - capacity` may have been
//! rewritten under it and is discarded as lost.

use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

use crate::{
    clock::Microsec,
    error::{Result, StoreError},
};

/// Entry meaning "slot reserved, nothing published"
pub const NO_CHANGE: i64 = -1;

/// Writer-side counters of the queue
#[repr(C)]
#[derive(Debug, Default)]
pub struct QueueCursor {
    /// Positions published to readers
    pub head: AtomicU64,
    /// Position being filled plus one; equal to `head` while the writer is idle
    pub claimed: AtomicU64,
}

/// One ring element as laid out in the segment
#[repr(C)]
#[derive(Debug, Default)]
pub struct QueueEntry {
    pub id: AtomicI64,
    pub timestamp: AtomicI64,
}

/// A change notification copied out of the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub id: i64,
    /// When the writer queued the change
    pub timestamp: Microsec,
}

/// Outcome of one tailing read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueRead {
    /// First position actually delivered, after overrun clamps
    pub start: u64,
    /// Position to resume from next time
    pub position: u64,
    /// Changes that were overwritten before they could be read
    pub lost: u64,
    /// `NO_CHANGE` entries that were dropped
    pub skipped: u64,
}

impl QueueRead {
    /// Whether the reader fell more than one capacity behind
    pub fn is_overrun(&self) -> bool {
        self.lost > 0
    }

    /// Number of queue positions consumed (including lost and skipped ones)
    pub fn advanced_by(&self, from: u64) -> u64 {
        self.position.saturating_sub(from)
    }
}

/// View of a segment's change queue
#[derive(Debug)]
pub struct ChangeQueue<'a> {
    cursor: &'a QueueCursor,
    ring: &'a [QueueEntry],
    mask: u64,
    writable: bool,
}

impl<'a> ChangeQueue<'a> {
    /// Build a queue view over shared memory.
    ///
    /// # Safety
    /// `cursor` and `ring` must be 8-byte aligned and valid for `'a`, `ring`
    /// for `capacity` entries; `capacity` must be a power of two.
    pub unsafe fn from_raw(
        cursor: *const QueueCursor,
        ring: *const QueueEntry,
        capacity: usize,
        writable: bool,
    ) -> Self {
        Self {
            cursor: &*cursor,
            ring: std::slice::from_raw_parts(ring, capacity),
            mask: capacity as u64 - 1,
            writable,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Current head with acquire ordering
    pub fn head(&self) -> u64 {
        self.cursor.head.load(Ordering::Acquire)
    }

    /// Raw entry stored for queue position `index`
    pub fn entry(&self, index: u64) -> Change {
        let entry = &self.ring[(index & self.mask) as usize];
        Change {
            id: entry.id.load(Ordering::Relaxed),
            timestamp: entry.timestamp.load(Ordering::Relaxed),
        }
    }

    /// Append `id` queued at `timestamp`; single writer thread only.
    ///
    /// Returns the new head.
    pub fn push(&self, id: i64, timestamp: Microsec) -> Result<u64> {
        if !self.writable {
            return Err(StoreError::read_only("write_queue"));
        }

        let head = self.cursor.head.load(Ordering::Relaxed);
        self.cursor.claimed.store(head + 1, Ordering::Relaxed);
        fence(Ordering::Release);

        let entry = &self.ring[(head & self.mask) as usize];
        entry.id.store(id, Ordering::Relaxed);
        entry.timestamp.store(timestamp, Ordering::Relaxed);
        self.cursor.head.store(head + 1, Ordering::Release);
        Ok(head + 1)
    }

    /// Reserve a position without announcing a change
    pub fn push_noop(&self) -> Result<u64> {
        self.push(NO_CHANGE, 0)
    }

    /// Append the changes in `[last_seen, head)` to `out`, at most `max`
    /// positions (0 = no limit), skipping `NO_CHANGE`.
    ///
    /// Falling more than `capacity` behind clamps the start to
    /// `head - capacity` and reports the gap in `lost`. Entries the writer
    /// overwrote while they were being copied are discarded and counted too.
    pub fn read_from(&self, last_seen: u64, max: usize, out: &mut Vec<Change>) -> QueueRead {
        let capacity = self.capacity();
        let head = self.head();

        if head <= last_seen {
            return QueueRead {
                start: head,
                position: head,
                ..Default::default()
            };
        }

        let mut start = last_seen;
        let mut lost = 0;
        if head - start > capacity {
            lost = head - capacity - start;
            start = head - capacity;
        }

        let end = match max {
            0 => head,
            max => head.min(start + max as u64),
        };

        let base = out.len();
        for index in start..end {
            out.push(self.entry(index));
        }

        // positions below claimed - capacity may have been rewritten mid-copy
        fence(Ordering::Acquire);
        let claimed = self.cursor.claimed.load(Ordering::Relaxed);
        let oldest_intact = claimed.saturating_sub(capacity);
        if oldest_intact > start {
            let clobbered = oldest_intact.min(end) - start;
            out.drain(base..base + clobbered as usize);
            lost += clobbered;
            start += clobbered;
        }

        let before = out.len();
        let mut index = base;
        out.retain(|change| {
            let keep = index < base || change.id != NO_CHANGE;
            index += 1;
            keep
        });
        let skipped = (before - out.len()) as u64;

        QueueRead {
            start,
            position: end.max(start),
            lost,
            skipped,
        }
    }

    /// Fill the ring with `NO_CHANGE` without moving the head
    pub fn clear(&self) -> Result<()> {
        if !self.writable {
            return Err(StoreError::read_only("clear_queue"));
        }
        for entry in self.ring {
            entry.id.store(NO_CHANGE, Ordering::Relaxed);
            entry.timestamp.store(0, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        Ok(())
    }
}
