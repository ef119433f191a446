//! Unified error handling for hippool
//!
//! Two layers of errors exist:
//! - [`DriverError`]: what a [`crate::driver::DeviceDriver`] reports. Out-of-memory
//!   is a distinct variant because the fallback ladder treats it as a retryable
//!   signal, not a failure.
//! - [`PoolError`]: what the pool surface reports to callers.
//!
//! State violations (deinit with outstanding handles, double-free of a block,
//! freeing a split block to the driver) are deliberately NOT error values.
//! They indicate a corrupted block graph and are fatal assertions.

use thiserror::Error;

/// Errors reported by the raw device driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The driver could not satisfy the allocation.
    #[error("device out of memory")]
    OutOfMemory,
    /// Any non-OOM driver failure. Propagated unchanged through the pool.
    #[error("driver fault: {0}")]
    Fault(String),
}

/// Errors surfaced by the pool allocation surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Allocation failed after the full three-phase fallback ladder
    /// (GC hints given, reclaimable buffers released, driver retried).
    #[error(
        "out of GPU memory: failed to allocate {requested} bytes \
         ({used} bytes allocated, {cached} bytes cached)"
    )]
    OutOfMemory {
        requested: usize,
        used: usize,
        cached: usize,
    },

    /// Non-OOM driver failure.
    #[error("driver fault: {0}")]
    DriverFault(String),

    /// Bad configuration (unparsable limit, unknown pool name).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<DriverError> for PoolError {
    fn from(err: DriverError) -> Self {
        match err {
            // OOM never reaches callers as a DriverError; the shim turns it
            // into a retry signal. If it does get here, report it as a fault.
            DriverError::OutOfMemory => PoolError::DriverFault("unexpected driver OOM".to_string()),
            DriverError::Fault(msg) => PoolError::DriverFault(msg),
        }
    }
}

impl PoolError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory is recoverable: the caller can free handles and retry.
    /// Driver faults and configuration errors are not; retrying without
    /// operator intervention will fail the same way.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PoolError::OutOfMemory { .. })
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

/// Pool result type
pub type PoolResult<T> = Result<T, PoolError>;
