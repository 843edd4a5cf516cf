//! Raw CUDA driver handle types shared by every crate in the workspace.
//!
//! Only the handful of driver types the overlay stage touches live here;
//! the function table itself is resolved in `veneer-cuda::sys`.

#![allow(non_camel_case_types, non_snake_case)]

use std::ffi::c_void;
use std::os::raw::{c_int, c_uint, c_ulonglong};

/// CUDA result code.
pub type CUresult = c_int;
pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
pub const CUDA_ERROR_INVALID_CONTEXT: CUresult = 201;
pub const CUDA_ERROR_INVALID_IMAGE: CUresult = 200;
pub const CUDA_ERROR_NOT_FOUND: CUresult = 500;
pub const CUDA_ERROR_LAUNCH_FAILED: CUresult = 719;

/// CUDA device pointer (64-bit).
pub type CUdeviceptr = c_ulonglong;

/// CUDA context handle.
pub type CUcontext = *mut c_void;

/// CUDA stream handle.
pub type CUstream = *mut c_void;

/// Loaded module handle.
pub type CUmodule = *mut c_void;

/// Kernel entry point handle.
pub type CUfunction = *mut c_void;

/// `CUmemorytype` discriminant.
pub type CUmemorytype = c_uint;
pub const CU_MEMORYTYPE_DEVICE: CUmemorytype = 2;

/// Mirror of `CUDA_MEMCPY2D` (driver API v2 layout).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CUDA_MEMCPY2D {
    pub srcXInBytes: usize,
    pub srcY: usize,
    pub srcMemoryType: CUmemorytype,
    pub srcHost: *const c_void,
    pub srcDevice: CUdeviceptr,
    pub srcArray: *mut c_void,
    pub srcPitch: usize,
    pub dstXInBytes: usize,
    pub dstY: usize,
    pub dstMemoryType: CUmemorytype,
    pub dstHost: *mut c_void,
    pub dstDevice: CUdeviceptr,
    pub dstArray: *mut c_void,
    pub dstPitch: usize,
    pub WidthInBytes: usize,
    pub Height: usize,
}

impl CUDA_MEMCPY2D {
    /// Device-to-device copy descriptor for one pitched plane.
    pub fn device_to_device(
        src: CUdeviceptr,
        src_pitch: usize,
        dst: CUdeviceptr,
        dst_pitch: usize,
        width_in_bytes: usize,
        height: usize,
    ) -> Self {
        Self {
            srcXInBytes: 0,
            srcY: 0,
            srcMemoryType: CU_MEMORYTYPE_DEVICE,
            srcHost: std::ptr::null(),
            srcDevice: src,
            srcArray: std::ptr::null_mut(),
            srcPitch: src_pitch,
            dstXInBytes: 0,
            dstY: 0,
            dstMemoryType: CU_MEMORYTYPE_DEVICE,
            dstHost: std::ptr::null_mut(),
            dstDevice: dst,
            dstArray: std::ptr::null_mut(),
            dstPitch: dst_pitch,
            WidthInBytes: width_in_bytes,
            Height: height,
        }
    }
}

/// Launch dimension triple as passed to `cuLaunchKernel`.
pub type Dim3 = (c_uint, c_uint, c_uint);

/// Signed 32-bit kernel scalar.
pub type KernelInt = c_int;
