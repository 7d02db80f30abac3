//! Fixed segment header and layout geometry
//!
//! ```text
//! ┌──────────────────────────┐ 0
//! │ SegmentHeader            │  geometry, description, liveness, queue head
//! ├──────────────────────────┤ queue_base_offset
//! │ change queue ring        │  queue_capacity × (id, timestamp)
//! ├──────────────────────────┤ header_size (cache-line aligned)
//! │ record slots             │  (max_id - base_id) × record_size
//! └──────────────────────────┘ segment_size (page aligned)
//! ```

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64};

use serde::{Deserialize, Serialize};

use crate::{
    config::MAX_DESCRIPTION_LEN,
    error::{Result, StoreError},
    queue::{QueueCursor, QueueEntry},
    sync::seqlock::{TIMESTAMP_OFFSET, VALUE_OFFSET},
};

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic number identifying a live segment
pub const SEGMENT_MAGIC: u64 = 0x5345_5153_544F_5245; // "SEQSTORE"

/// Magic written over a destroyed or replaced segment
pub const RETIRED_MAGIC: u64 = 0x5345_5144_4541_4421; // "SEQDEAD!"

/// Major layout version; readers reject other majors
pub const FILE_VERSION_MAJOR: u16 = 1;
/// Minor layout version
pub const FILE_VERSION_MINOR: u16 = 0;

/// Packed `major << 8 | minor`
pub const FILE_VERSION: u16 = (FILE_VERSION_MAJOR << 8) | FILE_VERSION_MINOR;

/// Alignment of value payloads inside a slot
pub const SLOT_ALIGNMENT: usize = 8;

/// A word on its own cache line
#[repr(C, align(64))]
#[derive(Debug)]
pub struct HotWord<T> {
    pub value: T,
}

/// Segment header as laid out at offset 0 of the mapping
#[repr(C, align(64))]
#[derive(Debug)]
pub struct SegmentHeader {
    /// Magic number for validation, stored last on creation
    pub magic: AtomicU64,
    /// Layout version
    pub file_version: u16,
    /// Application-defined version of the value format
    pub data_version: AtomicU16,
    _reserved0: u32,
    pub segment_size: u64,
    pub header_size: u64,
    pub record_size: u64,
    pub value_size: u64,
    pub value_offset: u64,
    pub timestamp_offset: u64,
    pub base_id: i64,
    pub max_id: i64,
    pub queue_capacity: u64,
    pub queue_head_offset: u64,
    pub queue_base_offset: u64,
    /// Creation time, lets readers notice a recreated store
    pub created_micros: AtomicI64,
    /// Writer process id
    pub owner_pid: AtomicU32,
    _reserved1: u32,
    /// NUL-terminated label
    pub description: [u8; MAX_DESCRIPTION_LEN],
    /// Liveness stamp written by the toucher
    pub last_touched_micros: HotWord<AtomicI64>,
    /// Change queue head and claim counters
    pub queue_cursor: HotWord<QueueCursor>,
}

impl SegmentHeader {
    /// Build a header for `geometry`; `magic` stays zero until published
    pub fn new(geometry: &Geometry, description: &str, created: i64, owner_pid: u32) -> Self {
        let mut label = [0u8; MAX_DESCRIPTION_LEN];
        let bytes = description.as_bytes();
        let len = bytes.len().min(MAX_DESCRIPTION_LEN - 1);
        label[..len].copy_from_slice(&bytes[..len]);

        Self {
            magic: AtomicU64::new(0),
            file_version: FILE_VERSION,
            data_version: AtomicU16::new(0),
            _reserved0: 0,
            segment_size: geometry.segment_size as u64,
            header_size: geometry.header_size as u64,
            record_size: geometry.record_size as u64,
            value_size: geometry.value_size as u64,
            value_offset: VALUE_OFFSET as u64,
            timestamp_offset: TIMESTAMP_OFFSET as u64,
            base_id: geometry.base_id,
            max_id: geometry.max_id,
            queue_capacity: geometry.queue_capacity as u64,
            queue_head_offset: geometry.queue_head_offset as u64,
            queue_base_offset: geometry.queue_base_offset as u64,
            created_micros: AtomicI64::new(created),
            owner_pid: AtomicU32::new(owner_pid),
            _reserved1: 0,
            description: label,
            last_touched_micros: HotWord { value: AtomicI64::new(0) },
            queue_cursor: HotWord {
                value: QueueCursor::default(),
            },
        }
    }

    /// Description up to the first NUL
    pub fn description(&self) -> &str {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_DESCRIPTION_LEN);
        std::str::from_utf8(&self.description[..end]).unwrap_or("")
    }
}

/// Byte geometry of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub base_id: i64,
    pub max_id: i64,
    pub value_size: usize,
    pub record_size: usize,
    pub queue_capacity: usize,
    pub queue_head_offset: usize,
    pub queue_base_offset: usize,
    pub header_size: usize,
    pub segment_size: usize,
}

fn align_up(value: usize, alignment: usize) -> Option<usize> {
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        4096
    }
}

impl Geometry {
    /// Lay out a segment for the given id range, value size and queue capacity
    pub fn compute(base_id: i64, max_id: i64, value_size: usize, queue_capacity: usize) -> Result<Self> {
        if max_id <= base_id {
            return Err(StoreError::invalid_argument("max_id", "max_id must be greater than base_id"));
        }
        if value_size == 0 {
            return Err(StoreError::invalid_argument("value_size", "Value size must be greater than 0"));
        }
        if queue_capacity == 0 || !queue_capacity.is_power_of_two() {
            return Err(StoreError::invalid_argument(
                "queue_capacity",
                "Queue capacity must be a non-zero power of 2",
            ));
        }

        let too_large = || StoreError::invalid_argument("geometry", "Segment size overflows");

        let records = usize::try_from(max_id.checked_sub(base_id).ok_or_else(too_large)?)
            .map_err(|_| too_large())?;
        let record_size = VALUE_OFFSET
            .checked_add(align_up(value_size, SLOT_ALIGNMENT).ok_or_else(too_large)?)
            .ok_or_else(too_large)?;

        let queue_base_offset = size_of::<SegmentHeader>();
        let queue_bytes = queue_capacity
            .checked_mul(size_of::<QueueEntry>())
            .ok_or_else(too_large)?;
        let header_size = align_up(
            queue_base_offset.checked_add(queue_bytes).ok_or_else(too_large)?,
            CACHE_LINE_SIZE,
        )
        .ok_or_else(too_large)?;

        let records_bytes = record_size.checked_mul(records).ok_or_else(too_large)?;
        let segment_size = align_up(
            header_size.checked_add(records_bytes).ok_or_else(too_large)?,
            page_size(),
        )
        .ok_or_else(too_large)?;

        Ok(Self {
            base_id,
            max_id,
            value_size,
            record_size,
            queue_capacity,
            queue_head_offset: offset_of!(SegmentHeader, queue_cursor),
            queue_base_offset,
            header_size,
            segment_size,
        })
    }

    /// Recompute the layout from a mapped header and check it is consistent.
    ///
    /// `mapped_len` is the length of the mapping the header came from.
    pub fn from_header(header: &SegmentHeader, mapped_len: usize) -> std::result::Result<Self, String> {
        let value_size = usize::try_from(header.value_size).map_err(|_| "value size overflows".to_string())?;
        let capacity =
            usize::try_from(header.queue_capacity).map_err(|_| "queue capacity overflows".to_string())?;

        let geometry = Self::compute(header.base_id, header.max_id, value_size, capacity)
            .map_err(|e| format!("inconsistent geometry: {}", e))?;

        let stored = (
            header.record_size,
            header.header_size,
            header.queue_base_offset,
            header.queue_head_offset,
            header.value_offset,
            header.timestamp_offset,
        );
        let expected = (
            geometry.record_size as u64,
            geometry.header_size as u64,
            geometry.queue_base_offset as u64,
            geometry.queue_head_offset as u64,
            VALUE_OFFSET as u64,
            TIMESTAMP_OFFSET as u64,
        );
        if stored != expected {
            return Err(format!("layout mismatch: stored {:?}, expected {:?}", stored, expected));
        }

        // segment size was rounded to the creator's page size
        let segment_size =
            usize::try_from(header.segment_size).map_err(|_| "segment size overflows".to_string())?;
        let minimum = geometry.header_size + geometry.record_size * geometry.record_count();
        if segment_size < minimum || segment_size > mapped_len {
            return Err(format!(
                "segment size {} outside [{}, {}]",
                segment_size, minimum, mapped_len
            ));
        }

        Ok(Self {
            segment_size,
            ..geometry
        })
    }

    /// Number of record slots
    pub fn record_count(&self) -> usize {
        (self.max_id - self.base_id) as usize
    }

    /// Check an identifier against `[base_id, max_id)`
    pub fn check_id(&self, id: i64) -> Result<()> {
        if id < self.base_id || id >= self.max_id {
            return Err(StoreError::out_of_range(id, self.base_id, self.max_id));
        }
        Ok(())
    }

    /// Byte offset of a slot: `header + (id - base_id) * record_size`
    pub fn slot_offset(&self, id: i64) -> Result<usize> {
        self.check_id(id)?;
        Ok(self.header_size + (id - self.base_id) as usize * self.record_size)
    }
}
