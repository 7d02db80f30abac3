//! Segment handle: one mapped record store

use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    clock::{duration_micros, now_micros, Microsec},
    error::{Result, StoreError},
    liveness::process_alive,
    memory::{SegmentConfig, SegmentName, SharedMapping},
    queue::{ChangeQueue, QueueCursor, QueueEntry},
    sync::{
        sequence::{committed, Revision},
        RecordSlot, SlotRead, SpinPolicy,
    },
};

use super::header::{Geometry, SegmentHeader, FILE_VERSION, FILE_VERSION_MAJOR, RETIRED_MAGIC, SEGMENT_MAGIC};

/// Serializable snapshot of a segment header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub description: String,
    pub file_version: String,
    pub data_version: u16,
    pub geometry: Geometry,
    pub owner_pid: u32,
    pub owner_alive: bool,
    pub created_micros: Microsec,
    pub last_touched_micros: Microsec,
    pub queue_head: u64,
    pub read_only: bool,
}

/// A mapped record store.
///
/// Created by exactly one writer; opened read-only by any number of readers.
/// All slot and queue traffic goes through the mapping, never through OS locks.
#[derive(Debug)]
pub struct Segment {
    mapping: SharedMapping,
    geometry: Geometry,
    spin: SpinPolicy,
    persist: bool,
    destroyed: bool,
}

impl Segment {
    /// Create a fresh segment, replacing any object of the same name.
    ///
    /// Readers still mapping a replaced object see it as detached.
    pub fn create(config: SegmentConfig) -> Result<Self> {
        config.validate()?;

        let name = SegmentName::parse(&config.name)?;
        let geometry = Geometry::compute(
            config.base_id,
            config.max_id,
            config.value_size,
            config.queue_capacity,
        )?;

        Self::retire_existing(&name);

        let mapping = SharedMapping::create(&name, geometry.segment_size, config.permissions)?;
        let base = mapping
            .as_mut_ptr()
            .ok_or_else(|| StoreError::read_only("create"))?;

        // fresh object: ftruncate zero-filled the queue and every slot
        let header = SegmentHeader::new(&geometry, &config.description, now_micros(), std::process::id());
        unsafe {
            std::ptr::write(base as *mut SegmentHeader, header);
        }

        let segment = Self {
            mapping,
            geometry,
            spin: config.spin,
            persist: config.persist,
            destroyed: false,
        };
        segment.header().magic.store(SEGMENT_MAGIC, Ordering::Release);

        log::debug!(
            "created segment {} ({}): ids [{}, {}), value {} bytes, queue {}, {} bytes",
            name,
            config.description,
            geometry.base_id,
            geometry.max_id,
            geometry.value_size,
            geometry.queue_capacity,
            geometry.segment_size
        );
        Ok(segment)
    }

    /// Mark an existing object dead so its readers detach, then unlink it
    fn retire_existing(name: &SegmentName) {
        if let Ok(old) = SharedMapping::open(name, true) {
            if old.len() >= size_of::<SegmentHeader>() {
                if let Some(base) = old.as_mut_ptr() {
                    let header = unsafe { &*(base as *const SegmentHeader) };
                    if header.magic.load(Ordering::Acquire) == SEGMENT_MAGIC {
                        header.magic.store(RETIRED_MAGIC, Ordering::Release);
                        log::debug!("retired existing segment {}", name);
                    }
                }
            }
        }

        if let Err(e) = SharedMapping::unlink(name) {
            log::warn!("could not unlink existing segment {}: {}", name, e);
        }
    }

    /// Map an existing segment read-only
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, false, SpinPolicy::default())
    }

    /// Re-open a segment for writing (the writer's own later re-open).
    ///
    /// Clears lock bits left by a writer that died mid-update and takes
    /// over ownership. Refused while the recorded owner is another live
    /// process, since its updates may be in flight.
    pub fn open_writable(name: &str) -> Result<Self> {
        let segment = Self::open_with(name, true, SpinPolicy::default())?;

        let owner = segment.owner_pid();
        if owner != std::process::id() && process_alive(owner) {
            return Err(StoreError::owner_alive(name, owner));
        }

        let recovered = segment.recover_locks()?;
        if recovered > 0 {
            log::warn!("{}: cleared {} stale record locks", name, recovered);
        }
        segment.header().owner_pid.store(std::process::id(), Ordering::Release);
        Ok(segment)
    }

    /// Map with an explicit access mode and spin policy.
    ///
    /// Only validates the header; no recovery or ownership change.
    pub fn open_with(name: &str, writable: bool, spin: SpinPolicy) -> Result<Self> {
        let parsed = SegmentName::parse(name)?;
        let mapping = SharedMapping::open(&parsed, writable)?;

        if mapping.len() < size_of::<SegmentHeader>() {
            return Err(StoreError::corrupt(name, "segment is truncated"));
        }

        let header = unsafe { &*(mapping.as_ptr() as *const SegmentHeader) };
        match header.magic.load(Ordering::Acquire) {
            SEGMENT_MAGIC => {}
            RETIRED_MAGIC => return Err(StoreError::corrupt(name, "segment has been retired")),
            _ => return Err(StoreError::corrupt(name, "bad magic number")),
        }

        if header.file_version >> 8 != FILE_VERSION_MAJOR {
            return Err(StoreError::corrupt(
                name,
                format!(
                    "incompatible file version {}.{}",
                    header.file_version >> 8,
                    header.file_version & 0xFF
                ),
            ));
        }

        let geometry =
            Geometry::from_header(header, mapping.len()).map_err(|message| StoreError::corrupt(name, message))?;

        let segment = Self {
            mapping,
            geometry,
            spin,
            persist: true,
            destroyed: false,
        };

        log::debug!(
            "opened segment {} ({}) {}",
            name,
            segment.description(),
            if writable { "read-write" } else { "read-only" }
        );
        Ok(segment)
    }

    fn recover_locks(&self) -> Result<usize> {
        let mut recovered = 0;
        for id in self.geometry.base_id..self.geometry.max_id {
            if self.slot(id)?.recover() {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Unmap, and for a writer also retire and unlink the backing object
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        if !self.mapping.is_writable() {
            return Ok(());
        }

        self.header().magic.store(RETIRED_MAGIC, Ordering::Release);
        if self.mapping.is_linked() {
            SharedMapping::unlink(self.mapping.name())?;
        }
        log::debug!("destroyed segment {}", self.mapping.name());
        Ok(())
    }

    /// Unlink a backing object by name; missing objects are not an error
    pub fn delete(name: &str) -> Result<bool> {
        SharedMapping::unlink(&SegmentName::parse(name)?)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mapping.as_ptr() as *const SegmentHeader) }
    }

    /// Fail if the segment was destroyed or replaced under us
    pub fn check_attached(&self) -> Result<()> {
        if self.header().magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(StoreError::detached(self.mapping.name().to_string()));
        }
        Ok(())
    }

    /// Whether the name still resolves to this mapping's object
    pub fn is_linked(&self) -> bool {
        self.mapping.is_linked()
    }

    pub fn name(&self) -> String {
        self.mapping.name().to_string()
    }

    pub fn description(&self) -> &str {
        self.header().description()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn base_id(&self) -> i64 {
        self.geometry.base_id
    }

    pub fn max_id(&self) -> i64 {
        self.geometry.max_id
    }

    pub fn record_size(&self) -> usize {
        self.geometry.record_size
    }

    pub fn value_size(&self) -> usize {
        self.geometry.value_size
    }

    pub fn value_offset(&self) -> usize {
        self.header().value_offset as usize
    }

    pub fn queue_capacity(&self) -> usize {
        self.geometry.queue_capacity
    }

    pub fn segment_size(&self) -> usize {
        self.geometry.segment_size
    }

    pub fn file_version(&self) -> u16 {
        self.header().file_version
    }

    pub fn data_version(&self) -> u16 {
        self.header().data_version.load(Ordering::Acquire)
    }

    pub fn set_data_version(&self, version: u16) -> Result<()> {
        self.require_writable("set_data_version")?;
        self.header().data_version.store(version, Ordering::Release);
        Ok(())
    }

    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    pub fn created_time(&self) -> Microsec {
        self.header().created_micros.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        !self.mapping.is_writable()
    }

    pub fn spin_policy(&self) -> &SpinPolicy {
        &self.spin
    }

    pub fn set_spin_policy(&mut self, spin: SpinPolicy) {
        self.spin = spin;
    }

    /// Keep or unlink the backing object when this writer is dropped
    pub fn set_persist(&mut self, persist: bool) {
        self.persist = persist;
    }

    fn require_writable(&self, operation: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(StoreError::read_only(operation));
        }
        Ok(())
    }

    /// Last liveness stamp written by the owner
    pub fn touched_time(&self) -> Result<Microsec> {
        self.check_attached()?;
        Ok(self.header().last_touched_micros.value.load(Ordering::Acquire))
    }

    /// Record that the writer is alive as of `now`
    pub fn touch(&self, now: Microsec) -> Result<()> {
        self.require_writable("touch")?;
        self.check_attached()?;
        self.header().last_touched_micros.value.store(now, Ordering::Release);
        Ok(())
    }

    /// Probe the owner pid with a null signal
    pub fn is_owner_alive(&self) -> bool {
        process_alive(self.owner_pid())
    }

    /// True if the last touch is at least `timeout` older than `now`
    pub fn is_orphaned(&self, timeout: Duration, now: Microsec) -> Result<bool> {
        let touched = self.touched_time()?;
        Ok(now - touched >= duration_micros(timeout))
    }

    /// Slot view for `id`
    pub fn slot(&self, id: i64) -> Result<RecordSlot<'_>> {
        let offset = self.geometry.slot_offset(id)?;
        self.check_attached()?;

        let writable = self.mapping.is_writable();
        let base = self.mapping.as_ptr() as *mut u8;
        // offset < segment_size <= mapping length, checked at open
        Ok(unsafe { RecordSlot::from_raw(id, base.add(offset), self.geometry.value_size, writable) })
    }

    /// Change queue view
    pub fn queue(&self) -> ChangeQueue<'_> {
        let base = self.mapping.as_ptr();
        unsafe {
            ChangeQueue::from_raw(
                base.add(self.geometry.queue_head_offset) as *const QueueCursor,
                base.add(self.geometry.queue_base_offset) as *const QueueEntry,
                self.geometry.queue_capacity,
                self.mapping.is_writable(),
            )
        }
    }

    /// Current change queue head
    pub fn queue_head(&self) -> u64 {
        self.queue().head()
    }

    /// Consistently copy record `id` into `dest`
    pub fn read_record(&self, id: i64, dest: &mut [u8]) -> Result<SlotRead> {
        self.slot(id)?.read(dest, &self.spin)
    }

    /// Committed revision of `id` without copying the value (0 = unwritten)
    pub fn revision(&self, id: i64) -> Result<Revision> {
        Ok(committed(self.slot(id)?.raw_revision()))
    }

    /// Write record `id` stamped with the current time and queue the change
    pub fn write_record(&self, id: i64, src: &[u8]) -> Result<Revision> {
        self.write_record_at(id, src, now_micros())
    }

    /// Write record `id` with an explicit timestamp and queue the change
    pub fn write_record_at(&self, id: i64, src: &[u8], timestamp: Microsec) -> Result<Revision> {
        self.geometry.check_id(id)?;
        if src.len() != self.geometry.value_size {
            return Err(StoreError::short_buffer(self.geometry.value_size, src.len()));
        }
        self.require_writable("write_record")?;

        let revision = self.slot(id)?.write(src, timestamp, &self.spin)?;
        self.queue().push(id, timestamp)?;
        Ok(revision)
    }

    /// Reset `id` to never-written and queue the change
    pub fn clear_record(&self, id: i64) -> Result<()> {
        self.geometry.check_id(id)?;
        self.require_writable("clear_record")?;

        self.slot(id)?.clear(&self.spin)?;
        self.queue().push(id, now_micros())?;
        Ok(())
    }

    /// Clear every slot and blank the change queue.
    ///
    /// The queue head keeps its value so tailing readers stay positioned.
    pub fn reset(&self) -> Result<()> {
        self.require_writable("reset")?;
        for id in self.geometry.base_id..self.geometry.max_id {
            self.slot(id)?.clear(&self.spin)?;
        }
        self.queue().clear()
    }

    /// Flush the mapping to its backing object
    pub fn sync(&self) -> Result<()> {
        self.mapping.flush()
    }

    /// Identifiers whose slot has been written
    pub fn used_ids(&self) -> impl Iterator<Item = i64> + '_ {
        (self.geometry.base_id..self.geometry.max_id)
            .filter(move |&id| matches!(self.revision(id), Ok(rev) if rev != 0))
    }

    /// Visit slots in id order, starting after `after` (or at the base id).
    ///
    /// Stops early when `visit` returns `Ok(false)`; returns whether every
    /// slot was visited.
    pub fn iterate<F>(&self, after: Option<i64>, mut visit: F) -> Result<bool>
    where
        F: FnMut(RecordSlot<'_>) -> Result<bool>,
    {
        let first = match after {
            Some(id) => {
                self.geometry.check_id(id)?;
                id + 1
            }
            None => self.geometry.base_id,
        };

        for id in first..self.geometry.max_id {
            if !visit(self.slot(id)?)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Lowest id whose slot has never been written
    pub fn find_first_unused(&self) -> Result<Option<i64>> {
        for id in self.geometry.base_id..self.geometry.max_id {
            if self.revision(id)? == 0 {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Highest id whose slot has been written
    pub fn find_last_used(&self) -> Result<Option<i64>> {
        for id in (self.geometry.base_id..self.geometry.max_id).rev() {
            if self.revision(id)? != 0 {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Header snapshot
    pub fn info(&self) -> SegmentInfo {
        let header = self.header();
        SegmentInfo {
            name: self.name(),
            description: self.description().to_string(),
            file_version: format!("{}.{}", header.file_version >> 8, header.file_version & 0xFF),
            data_version: self.data_version(),
            geometry: self.geometry,
            owner_pid: self.owner_pid(),
            owner_alive: self.is_owner_alive(),
            created_micros: self.created_time(),
            last_touched_micros: header.last_touched_micros.value.load(Ordering::Acquire),
            queue_head: self.queue_head(),
            read_only: self.is_read_only(),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.destroyed || self.persist || !self.mapping.is_writable() {
            return;
        }

        self.header().magic.store(RETIRED_MAGIC, Ordering::Release);
        if self.mapping.is_linked() {
            if let Err(e) = SharedMapping::unlink(self.mapping.name()) {
                log::warn!("failed to unlink {}: {}", self.mapping.name(), e);
            }
        }
    }
}

/// Current layout version as `major.minor`
pub fn file_version_string() -> String {
    format!("{}.{}", FILE_VERSION >> 8, FILE_VERSION & 0xFF)
}
