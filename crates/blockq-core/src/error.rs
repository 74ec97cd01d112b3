//! Error types for block decoding and buffer pooling.

use thiserror::Error;

/// Result type alias for blockq operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Block codec and buffer pool errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A source or destination slice is shorter than the row requires.
    #[error("buffer too small: need {required} bytes, got {provided}")]
    BufferTooSmall { required: usize, provided: usize },

    /// The underlying device allocator could not satisfy a request.
    #[error("allocation failed: could not allocate {requested_bytes} bytes: {reason}")]
    AllocationFailed {
        requested_bytes: usize,
        reason: String,
    },

    /// A pool was configured with no slots.
    #[error("invalid pool capacity {0}: must be at least 1")]
    InvalidCapacity(usize),

    /// A block format name did not match any known layout.
    #[error("unknown block format: {0}")]
    UnknownFormat(String),
}

impl Error {
    /// Create a buffer too small error.
    pub fn buffer_too_small(required: usize, provided: usize) -> Self {
        Error::BufferTooSmall { required, provided }
    }

    /// Create an allocation failure carrying the allocator's diagnostic.
    pub fn allocation_failed(requested_bytes: usize, reason: impl Into<String>) -> Self {
        Error::AllocationFailed {
            requested_bytes,
            reason: reason.into(),
        }
    }

    /// Check if the error leaves the process without usable device memory.
    ///
    /// Nothing in blockq retries a fatal error; callers are expected to
    /// tear down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AllocationFailed { .. })
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::BufferTooSmall { .. } => "buffer_too_small",
            Error::AllocationFailed { .. } => "allocation_failed",
            Error::InvalidCapacity(_) => "invalid_capacity",
            Error::UnknownFormat(_) => "unknown_format",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_failure_is_fatal() {
        let err = Error::allocation_failed(4096, "cuMemAlloc failed");
        assert!(err.is_fatal());
        assert_eq!(err.category(), "allocation_failed");
        assert_eq!(
            err.to_string(),
            "allocation failed: could not allocate 4096 bytes: cuMemAlloc failed"
        );
    }

    #[test]
    fn test_buffer_too_small_is_not_fatal() {
        let err = Error::buffer_too_small(40, 20);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "buffer too small: need 40 bytes, got 20");
    }
}
