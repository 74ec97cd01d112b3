//! Error types for CUDA dequantization.

use std::panic::Location;

use cudarc::driver::DriverError;
use thiserror::Error;

/// Result type for CUDA operations.
pub type Result<T> = std::result::Result<T, CudaError>;

/// Errors that can occur while setting up or driving the device.
#[derive(Error, Debug)]
pub enum CudaError {
    /// A CUDA driver call failed.
    #[error("CUDA error in {call} at {}:{}: {source}", .location.file(), .location.line())]
    Driver {
        /// Name of the failing runtime call.
        call: &'static str,
        /// Call site that issued it.
        location: &'static Location<'static>,
        source: DriverError,
    },

    /// NVRTC rejected the kernel source.
    #[error("CUDA kernel compilation failed: {0}")]
    Compile(String),

    /// A compiled kernel could not be found in its module.
    #[error("CUDA kernel load failed: {0}")]
    KernelLoad(String),

    /// Device buffer too small for the row being dispatched.
    #[error("Buffer size mismatch: expected at least {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Device not found.
    #[error("CUDA device {0} not found")]
    DeviceNotFound(usize),

    /// cuBLAS handle setup failed.
    #[error("cuBLAS setup failed: {0}")]
    Blas(String),

    /// Codec or pool error.
    #[error(transparent)]
    Core(#[from] blockq_core::Error),
}

impl CudaError {
    /// Check if this error leaves the context unusable.
    ///
    /// Only a size mismatch is a caller mistake that can be fixed and
    /// retried; everything else is a setup or runtime failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            CudaError::SizeMismatch { .. } => false,
            CudaError::Core(err) => err.is_fatal(),
            _ => true,
        }
    }

    /// Check if this error indicates the GPU is unavailable.
    pub fn is_device_error(&self) -> bool {
        matches!(self, CudaError::DeviceNotFound(_) | CudaError::Driver { .. })
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            CudaError::Driver { .. } => "driver",
            CudaError::Compile(_) => "compile",
            CudaError::KernelLoad(_) => "kernel_load",
            CudaError::SizeMismatch { .. } => "size_mismatch",
            CudaError::DeviceNotFound(_) => "device_not_found",
            CudaError::Blas(_) => "blas",
            CudaError::Core(err) => err.category(),
        }
    }
}

/// Attach the failing call name and call site to a driver result.
pub(crate) trait DriverResultExt<T> {
    fn check(self, call: &'static str) -> Result<T>;
}

impl<T> DriverResultExt<T> for std::result::Result<T, DriverError> {
    #[track_caller]
    fn check(self, call: &'static str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|source| {
            tracing::error!(
                call,
                file = location.file(),
                line = location.line(),
                error = %source,
                "CUDA call failed"
            );
            CudaError::Driver {
                call,
                location,
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch_is_not_fatal() {
        let err = CudaError::SizeMismatch {
            expected: 80,
            actual: 40,
        };
        assert!(!err.is_fatal());
        assert!(!err.is_device_error());
        assert_eq!(err.category(), "size_mismatch");
        assert_eq!(
            err.to_string(),
            "Buffer size mismatch: expected at least 80 bytes, got 40"
        );
    }

    #[test]
    fn test_core_errors_keep_their_classification() {
        let alloc: CudaError = blockq_core::Error::allocation_failed(64, "out of memory").into();
        assert!(alloc.is_fatal());
        assert_eq!(alloc.category(), "allocation_failed");

        let short: CudaError = blockq_core::Error::buffer_too_small(40, 20).into();
        assert!(!short.is_fatal());
        assert_eq!(short.to_string(), "buffer too small: need 40 bytes, got 20");
    }

    #[test]
    fn test_device_not_found() {
        let err = CudaError::DeviceNotFound(3);
        assert!(err.is_fatal());
        assert!(err.is_device_error());
        assert_eq!(err.to_string(), "CUDA device 3 not found");
    }
}
