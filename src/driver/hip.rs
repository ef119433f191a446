//! HIP driver implementation
//!
//! Wraps hipMalloc/hipFree behind the [`DeviceDriver`] trait. Only built
//! with the `rocm` feature; the host-only build uses mock drivers in tests.

use std::ffi::CStr;
use std::ptr;

use crate::driver::{ffi, DeviceBuffer, DeviceDriver};
use crate::error::{DriverError, PoolError, PoolResult};

/// Translate a HIP error code into the runtime's error string.
fn error_string(code: i32) -> String {
    unsafe {
        let raw = ffi::hipGetErrorString(code);
        if raw.is_null() {
            format!("HIP error {}", code)
        } else {
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    }
}

/// The real ROCm/HIP allocation primitive for a single device.
#[derive(Debug)]
pub struct HipDriver {
    device: i32,
}

impl HipDriver {
    /// Initialize the HIP runtime and bind to `device`.
    pub fn new(device: i32) -> PoolResult<Self> {
        let code = unsafe { ffi::hipInit(0) };
        if code != ffi::HIP_SUCCESS {
            return Err(PoolError::DriverFault(format!(
                "hipInit failed: {}",
                error_string(code)
            )));
        }

        let mut count: i32 = 0;
        let code = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if code != ffi::HIP_SUCCESS {
            return Err(PoolError::DriverFault(format!(
                "hipGetDeviceCount failed: {}",
                error_string(code)
            )));
        }
        if device < 0 || device >= count {
            return Err(PoolError::DriverFault(format!(
                "device {} not present ({} devices)",
                device, count
            )));
        }

        let code = unsafe { ffi::hipSetDevice(device) };
        if code != ffi::HIP_SUCCESS {
            return Err(PoolError::DriverFault(format!(
                "hipSetDevice({}) failed: {}",
                device,
                error_string(code)
            )));
        }

        tracing::info!("HipDriver bound to device {}", device);
        Ok(HipDriver { device })
    }

    /// Free and total device memory in bytes, straight from the runtime.
    pub fn mem_info(&self) -> PoolResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let code = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if code != ffi::HIP_SUCCESS {
            return Err(PoolError::DriverFault(format!(
                "hipMemGetInfo failed: {}",
                error_string(code)
            )));
        }
        Ok((free, total))
    }
}

impl DeviceDriver for HipDriver {
    fn device_alloc(&self, nbytes: usize) -> Result<DeviceBuffer, DriverError> {
        let mut raw: *mut std::ffi::c_void = ptr::null_mut();
        tracing::trace!("hipMalloc: {} bytes", nbytes);

        let code = unsafe { ffi::hipMalloc(&mut raw, nbytes) };
        if code == ffi::HIP_ERROR_OUT_OF_MEMORY {
            return Err(DriverError::OutOfMemory);
        }
        if code != ffi::HIP_SUCCESS {
            return Err(DriverError::Fault(format!(
                "hipMalloc failed for {} bytes: {}",
                nbytes,
                error_string(code)
            )));
        }
        if raw.is_null() {
            return Err(DriverError::Fault(format!(
                "hipMalloc returned null pointer for {} bytes",
                nbytes
            )));
        }

        Ok(DeviceBuffer::from_raw_parts(raw as usize, nbytes, self.device))
    }

    fn device_free(&self, buf: &DeviceBuffer) -> Result<(), DriverError> {
        tracing::trace!("hipFree: {} bytes at 0x{:x}", buf.size(), buf.addr());
        let code = unsafe { ffi::hipFree(buf.addr() as *mut std::ffi::c_void) };
        if code != ffi::HIP_SUCCESS {
            return Err(DriverError::Fault(format!(
                "hipFree failed at 0x{:x}: {}",
                buf.addr(),
                error_string(code)
            )));
        }
        Ok(())
    }

    fn is_context_valid(&self, buf: &DeviceBuffer) -> bool {
        // The runtime tears contexts down at process exit; once that has
        // happened device queries start failing and pending frees must be
        // dropped rather than reported.
        let mut count: i32 = 0;
        let code = unsafe { ffi::hipGetDeviceCount(&mut count) };
        code == ffi::HIP_SUCCESS && buf.device() < count
    }
}
