//! # Seqstore - Shared-Memory Record Store
//!
//! Seqstore keeps a fixed array of fixed-size records in a named,
//! memory-mapped segment. One writer process updates records; any number of
//! reader processes map the same segment and read records without taking
//! OS locks, tail a change queue to learn which records moved, and watch a
//! liveness stamp to tell an idle feed from a dead writer.
//!
//! ## Features
//!
//! - **Sequence-locked slots**: readers retry torn copies and never block the writer
//! - **Change queue**: bounded ring of written ids with explicit overrun reporting
//! - **Liveness**: periodic touch thread, staleness watcher, owner pid probe
//! - **Batch access**: columnar batch reads and a change-tailing reader
//! - **Named backing objects**: POSIX shm (`shm:NAME`) or files on tmpfs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  write_record   ┌──────────────────────────────────┐
//! │    Writer    │────────────────▶│ Segment                          │
//! │  + Toucher   │  touch(now)     │  header │ change queue │ slots   │
//! └──────────────┘                 └──────────────────────────────────┘
//!                                        ▲             ▲          ▲
//!                         LivenessWatcher│ ChangeReader│ read_many│
//!                                  ┌─────┴─────────────┴──────────┴──┐
//!                                  │     Readers (any process)       │
//!                                  └─────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use seqstore::{Segment, SegmentConfig};
//!
//! let config = SegmentConfig::new("shm:prints", 1024, 64).with_description("PRINTS");
//! let writer = Segment::create(config)?;
//! writer.write_record(7, &[1u8; 64])?;
//!
//! let reader = Segment::open("shm:prints")?;
//! let mut value = [0u8; 64];
//! let read = reader.read_record(7, &mut value)?;
//! assert!(read.revision > 0);
//! # Ok::<(), seqstore::StoreError>(())
//! ```

pub mod batch;
pub mod clock;
pub mod error;
pub mod liveness;
pub mod memory;
pub mod queue;
pub mod segment;
pub mod sync;

// Main API re-exports
pub use batch::{
    read_many, write_many, ChangeReader, LatencyStats, OverrunPolicy, PollPolicy, RecordBatch, RecordView,
};
pub use clock::{now_micros, Microsec};
pub use error::{ErrorCode, Result, StoreError};
pub use liveness::{process_alive, Liveness, LivenessWatcher, Toucher};
pub use memory::{SegmentConfig, SegmentName, SharedMapping};
pub use queue::{Change, ChangeQueue, QueueRead, NO_CHANGE};
pub use segment::{Geometry, Segment, SegmentInfo};
pub use sync::{Revision, SlotRead, SpinPolicy};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_PATCH: u32 = 0;

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default change queue capacity (power of two)
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    /// Interval between liveness touches
    pub const DEFAULT_TOUCH_PERIOD: Duration = Duration::from_secs(1);

    /// Touch age after which a writer is presumed stuck
    pub const DEFAULT_ORPHAN_TIMEOUT: Duration = Duration::from_secs(3);

    /// Mode bits for newly created backing objects
    pub const DEFAULT_PERMISSIONS: u32 = 0o644;

    /// Description field size, including the terminating NUL
    pub const MAX_DESCRIPTION_LEN: usize = 256;
}
