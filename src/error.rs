//! Error types and handling for seqstore

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Closed set of result codes exposed by the store.
///
/// Every [`StoreError`] maps onto exactly one code, so callers that only
/// care about the category (retry, resync, give up) can match on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    OutOfRange,
    InvalidArgument,
    Corrupt,
    ShortBuffer,
    /// A lock could not be taken within the configured spin budget
    WouldBlock,
    ReadOnly,
    Overrun,
    Io,
}

impl ErrorCode {
    /// Short stable name of the code
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not-found",
            ErrorCode::OutOfRange => "out-of-range",
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::ShortBuffer => "short-buffer",
            ErrorCode::WouldBlock => "would-block",
            ErrorCode::ReadOnly => "read-only",
            ErrorCode::Overrun => "overrun",
            ErrorCode::Io => "io",
        }
    }
}

/// Error types for the shared-memory record store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O related errors (open, ftruncate, mmap, unlink, ...)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid parameters or configuration
    #[error("Invalid argument: {parameter} - {message}")]
    InvalidArgument { parameter: String, message: String },

    /// Backing object does not exist
    #[error("Segment not found: {name}")]
    SegmentNotFound { name: String },

    /// Record slot was never written
    #[error("Record not found: id {id}")]
    RecordNotFound { id: i64 },

    /// Segment was destroyed or recreated while still mapped
    #[error("Segment detached: {name} was destroyed or recreated")]
    Detached { name: String },

    /// Identifier outside `[base_id, max_id)`
    #[error("Identifier out of range: {id} not in [{base_id}, {max_id})")]
    OutOfRange { id: i64, base_id: i64, max_id: i64 },

    /// Caller buffer does not match the configured value size
    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },

    /// Header failed validation
    #[error("Segment corrupt: {name}: {message}")]
    Corrupt { name: String, message: String },

    /// Spin budget exhausted while waiting on a lock
    #[error("Would block: {operation} gave up after {waited_micros}us")]
    WouldBlock { operation: String, waited_micros: u64 },

    /// Write attempted through a read-only mapping
    #[error("Segment is read-only: {operation}")]
    ReadOnly { operation: String },

    /// Another live process owns the segment for writing
    #[error("Segment {name} is owned by live process {pid}")]
    OwnerAlive { name: String, pid: u32 },

    /// Change-queue reader fell more than one capacity behind
    #[error("Change queue overrun: {lost} changes lost (head {head}, capacity {capacity})")]
    Overrun { lost: u64, head: u64, capacity: u64 },
}

impl StoreError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an I/O error from a nix errno
    pub fn from_errno(errno: nix::Error, context: &str) -> Self {
        Self::from_io(std::io::Error::from(errno), context)
    }

    /// Create an invalid argument error
    pub fn invalid_argument(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn segment_not_found(name: impl Into<String>) -> Self {
        Self::SegmentNotFound { name: name.into() }
    }

    pub fn record_not_found(id: i64) -> Self {
        Self::RecordNotFound { id }
    }

    pub fn detached(name: impl Into<String>) -> Self {
        Self::Detached { name: name.into() }
    }

    pub fn out_of_range(id: i64, base_id: i64, max_id: i64) -> Self {
        Self::OutOfRange { id, base_id, max_id }
    }

    pub fn short_buffer(expected: usize, actual: usize) -> Self {
        Self::ShortBuffer { expected, actual }
    }

    pub fn corrupt(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn would_block(operation: impl Into<String>, waited_micros: u64) -> Self {
        Self::WouldBlock {
            operation: operation.into(),
            waited_micros,
        }
    }

    pub fn read_only(operation: impl Into<String>) -> Self {
        Self::ReadOnly {
            operation: operation.into(),
        }
    }

    pub fn owner_alive(name: impl Into<String>, pid: u32) -> Self {
        Self::OwnerAlive { name: name.into(), pid }
    }

    pub fn overrun(lost: u64, head: u64, capacity: u64) -> Self {
        Self::Overrun { lost, head, capacity }
    }

    /// Result code category of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Io { .. } => ErrorCode::Io,
            StoreError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            StoreError::SegmentNotFound { .. }
            | StoreError::RecordNotFound { .. }
            | StoreError::Detached { .. } => ErrorCode::NotFound,
            StoreError::OutOfRange { .. } => ErrorCode::OutOfRange,
            StoreError::ShortBuffer { .. } => ErrorCode::ShortBuffer,
            StoreError::Corrupt { .. } => ErrorCode::Corrupt,
            StoreError::WouldBlock { .. } | StoreError::OwnerAlive { .. } => ErrorCode::WouldBlock,
            StoreError::ReadOnly { .. } => ErrorCode::ReadOnly,
            StoreError::Overrun { .. } => ErrorCode::Overrun,
        }
    }

    /// True for the "slot never written" case
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::Error> for StoreError {
    fn from(err: nix::Error) -> Self {
        Self::from_errno(err, "system call failed")
    }
}
