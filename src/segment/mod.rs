//! Record store segments
//!
//! A segment is one named, memory-mapped object holding a fixed header, the
//! change queue ring and an array of sequence-locked record slots indexed by
//! `id - base_id`.

pub mod header;
pub mod store;

pub use header::{
    Geometry, SegmentHeader, CACHE_LINE_SIZE, FILE_VERSION, FILE_VERSION_MAJOR, FILE_VERSION_MINOR,
    RETIRED_MAGIC, SEGMENT_MAGIC,
};
pub use store::{file_version_string, Segment, SegmentInfo};
