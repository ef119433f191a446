//! Device driver contract and buffer handle
//!
//! Everything above this module talks to the GPU through the
//! [`DeviceDriver`] trait. The real implementation ([`HipDriver`], behind
//! the `rocm` feature) wraps hipMalloc/hipFree; tests substitute host-side
//! mock drivers. The pool never touches buffer contents, only identities
//! and sizes, so the handle works the same either way.

pub mod allocator;
#[cfg(feature = "rocm")]
pub mod ffi;
#[cfg(feature = "rocm")]
pub mod hip;

pub use allocator::DeviceAllocator;
#[cfg(feature = "rocm")]
pub use hip::HipDriver;

use crate::error::DriverError;

/// Handle to a contiguous device-memory region.
///
/// The address is used for equality and arithmetic only; the pool never
/// dereferences it. Handles are exclusively owned by convention: at any
/// instant a handle is held by the application, sits in a pool free-list,
/// or has been returned to the driver. `Clone` exists so the pool can keep
/// its own copy in the allocated map while the application holds the
/// original; cloning does not duplicate the underlying memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    addr: usize,
    size: usize,
    device: i32,
}

impl DeviceBuffer {
    /// Construct a handle from its raw parts. Called by driver
    /// implementations when minting buffers and by the split pool when
    /// carving block views out of a base buffer.
    pub fn from_raw_parts(addr: usize, size: usize, device: i32) -> Self {
        DeviceBuffer { addr, size, device }
    }

    /// Buffer size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address-like identity (opaque; equality and arithmetic only)
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Device ordinal that minted this buffer
    pub fn device(&self) -> i32 {
        self.device
    }
}

/// Raw device allocation primitive.
///
/// Implementations must be cheap to call concurrently; the pool serializes
/// its own bookkeeping but not driver calls.
pub trait DeviceDriver: Send + Sync {
    /// Allocate `nbytes` of device memory.
    ///
    /// Returns [`DriverError::OutOfMemory`] when the device cannot satisfy
    /// the request; any other failure is a [`DriverError::Fault`].
    fn device_alloc(&self, nbytes: usize) -> Result<DeviceBuffer, DriverError>;

    /// Return a buffer to the device.
    fn device_free(&self, buf: &DeviceBuffer) -> Result<(), DriverError>;

    /// Whether the device context that minted `buf` is still alive.
    ///
    /// Freeing a buffer whose context is gone is a no-op on the driver
    /// side (the context already released its allocations at teardown).
    fn is_context_valid(&self, buf: &DeviceBuffer) -> bool;
}
