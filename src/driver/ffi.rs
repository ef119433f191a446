//! HIP FFI bindings
//!
//! FFI declarations below are bound to the ROCm HIP runtime, trimmed to
//! the memory-management surface this crate consumes. All functions are
//! called through wrapper methods on [`super::hip::HipDriver`]; the
//! dead_code allowance is needed because FFI symbols appear unused to the
//! compiler.

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipGetDevice(deviceId: *mut i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// hipErrorOutOfMemory: the device cannot satisfy the allocation
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;
