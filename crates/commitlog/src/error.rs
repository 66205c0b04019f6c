use std::fmt::Display;

/// A specialized error type for commitlog operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CommitlogError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A record exceeds the maximum mutation size and must not be retried as-is.
    #[error("record of {size} bytes is too large for the maximum size of {limit}")]
    RecordTooLarge { size: u64, limit: u64 },
    /// An admission-control or segment-availability wait ran out its deadline.
    #[error("commitlog: timed out")]
    Timeout,
    /// The target segment stopped accepting writes.
    #[error("cannot add data to a closed segment")]
    ClosedSegment,
    /// The commitlog has been shut down; no further operations are accepted.
    #[error("commitlog has been shut down, cannot add data")]
    Shutdown,
    /// Allocation of a fresh segment failed for every waiter of that allocation.
    #[error("failed to allocate a new segment: {0}")]
    SegmentAllocation(String),
    /// A segment file name did not match the descriptor grammar.
    #[error("cannot parse segment file name: {0}")]
    InvalidSegmentName(String),
    /// A legacy segment file name without an embedded version.
    #[error("segment {0} is too old to replay")]
    SegmentTooOld(String),
    /// A replayed file did not carry the expected magic value.
    #[error("invalid segment format: {0}")]
    InvalidSegmentFormat(String),
    /// The descriptor header checksum in a replayed file did not match.
    #[error("segment header checksum mismatch: {0}")]
    HeaderChecksum(String),
    /// Unrecoverable bytes were found while replaying a segment. All valid
    /// entries preceding the failure have already been delivered.
    #[error("segment data corruption: {bytes} unrecoverable bytes")]
    DataCorruption { bytes: u64 },
    /// Internal error (task join failures, accounting bugs, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommitlogError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }
}

/// A Result type alias for commitlog operations.
pub type CommitlogResult<T> = Result<T, CommitlogError>;
