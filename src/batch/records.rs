//! Columnar record batches and per-element batch read/write

use crate::{
    clock::Microsec,
    error::{Result, StoreError},
    segment::Segment,
    sync::Revision,
};

/// One record inside a [`RecordBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub id: i64,
    /// 0 when the slot was unwritten at read time
    pub revision: Revision,
    pub timestamp: Microsec,
    pub value: &'a [u8],
}

/// Reusable buffers for batch reads.
///
/// Values are packed back to back, `value_size` bytes each, so repeated
/// reads into the same batch do not reallocate once it has grown.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    value_size: usize,
    ids: Vec<i64>,
    revisions: Vec<Revision>,
    timestamps: Vec<Microsec>,
    values: Vec<u8>,
}

impl RecordBatch {
    pub fn new(value_size: usize) -> Self {
        Self::with_capacity(value_size, 0)
    }

    pub fn with_capacity(value_size: usize, records: usize) -> Self {
        Self {
            value_size,
            ids: Vec::with_capacity(records),
            revisions: Vec::with_capacity(records),
            timestamps: Vec::with_capacity(records),
            values: Vec::with_capacity(records * value_size),
        }
    }

    /// Batch sized for `segment`'s values
    pub fn for_segment(segment: &Segment) -> Self {
        Self::new(segment.value_size())
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop all records, keeping allocations
    pub fn clear(&mut self) {
        self.ids.clear();
        self.revisions.clear();
        self.timestamps.clear();
        self.values.clear();
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn timestamps(&self) -> &[Microsec] {
        &self.timestamps
    }

    /// All values, packed
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.value_size)?;
        self.values.get(start..start + self.value_size)
    }

    pub fn get(&self, index: usize) -> Option<RecordView<'_>> {
        Some(RecordView {
            id: *self.ids.get(index)?,
            revision: self.revisions[index],
            timestamp: self.timestamps[index],
            value: self.value(index)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> + '_ {
        (0..self.len()).filter_map(move |index| self.get(index))
    }

    /// Drop records past the first `len`
    pub(crate) fn truncate(&mut self, len: usize) {
        self.ids.truncate(len);
        self.revisions.truncate(len);
        self.timestamps.truncate(len);
        self.values.truncate(len * self.value_size);
    }

    fn check_segment(&self, segment: &Segment) -> Result<()> {
        if self.value_size != segment.value_size() {
            return Err(StoreError::short_buffer(segment.value_size(), self.value_size));
        }
        Ok(())
    }

    /// Read `id` through the slot protocol and append it.
    ///
    /// An unwritten slot is appended with revision 0 and zeroed bytes when
    /// `keep_unwritten` is set, skipped otherwise. Returns whether a record
    /// was appended.
    pub(crate) fn read_into(&mut self, segment: &Segment, id: i64, keep_unwritten: bool) -> Result<bool> {
        let start = self.values.len();
        self.values.resize(start + self.value_size, 0);

        match segment.read_record(id, &mut self.values[start..]) {
            Ok(read) => {
                self.ids.push(id);
                self.revisions.push(read.revision);
                self.timestamps.push(read.timestamp);
                Ok(true)
            }
            Err(StoreError::RecordNotFound { .. }) if keep_unwritten => {
                self.values[start..].fill(0);
                self.ids.push(id);
                self.revisions.push(0);
                self.timestamps.push(0);
                Ok(true)
            }
            Err(StoreError::RecordNotFound { .. }) => {
                self.values.truncate(start);
                Ok(false)
            }
            Err(e) => {
                self.values.truncate(start);
                Err(e)
            }
        }
    }
}

/// Read each of `ids` into `batch`, replacing its contents.
///
/// Each element is independently consistent; the batch as a whole is not a
/// snapshot. The first failing element aborts the batch.
pub fn read_many(segment: &Segment, ids: &[i64], batch: &mut RecordBatch) -> Result<usize> {
    batch.check_segment(segment)?;
    batch.clear();
    for &id in ids {
        batch.read_into(segment, id, true)?;
    }
    Ok(batch.len())
}

/// Write each `(id, value)` in order, stopping at the first failure.
///
/// Returns the revisions published so far.
pub fn write_many<'v, I>(segment: &Segment, entries: I) -> Result<Vec<Revision>>
where
    I: IntoIterator<Item = (i64, &'v [u8])>,
{
    entries
        .into_iter()
        .map(|(id, value)| segment.write_record(id, value))
        .collect()
}
