//! Batch access built on the single-record protocol
//!
//! Batches amortize buffer allocation only. Every element goes through the
//! slot read/write protocol on its own; there is no atomicity across elements.

pub mod changes;
pub mod latency;
pub mod records;

pub use changes::{ChangeReader, OverrunPolicy, PollPolicy};
pub use latency::{Latency, LatencyStats};
pub use records::{read_many, write_many, RecordBatch, RecordView};
