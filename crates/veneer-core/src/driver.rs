//! CUDA driver function table contract.
//!
//! The overlay stage never links the driver directly: it goes through a
//! [`CudaDriver`] table that the device context hands out.  The production
//! table is resolved from `libcuda` at runtime (`veneer-cuda::sys`); tests
//! plug in [`crate::mock::MockDriver`].
//!
//! Methods return the raw `CUresult` so callers decide how to report it;
//! [`check_cu`] turns a failure into [`VeneerError::Driver`] with the
//! driver's own symbolic name and description attached.

use std::fmt;

use crate::error::{Result, VeneerError};
use crate::ffi_types::{
    CUDA_MEMCPY2D, CUDA_SUCCESS, CUcontext, CUdeviceptr, CUfunction, CUmodule, CUresult,
    CUstream, Dim3,
};

/// One kernel parameter, in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelArg {
    /// Device pointer (`T*` in the kernel signature).
    Ptr(CUdeviceptr),
    /// `int` scalar.
    I32(i32),
}

/// Grid/block geometry of a single launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
}

/// Dynamically resolved driver entry points used by the overlay stage.
///
/// Every method must be called with the owning context current, except
/// `ctx_push_current` itself and the two error-description lookups.
pub trait CudaDriver: Send + Sync {
    /// `cuCtxPushCurrent_v2`.
    fn ctx_push_current(&self, ctx: CUcontext) -> CUresult;

    /// `cuCtxPopCurrent_v2`, discarding the popped handle.
    fn ctx_pop_current(&self) -> CUresult;

    /// `cuModuleLoadData` on a NUL-terminated PTX or cubin image.
    fn module_load_data(&self, module: &mut CUmodule, image: &[u8]) -> CUresult;

    /// `cuModuleUnload`.
    fn module_unload(&self, module: CUmodule) -> CUresult;

    /// `cuModuleGetFunction`.
    fn module_get_function(&self, func: &mut CUfunction, module: CUmodule, name: &str)
    -> CUresult;

    /// `cuLaunchKernel`, asynchronous on `stream`.
    ///
    /// # Safety
    /// `func` must be a live function handle, and every pointer argument
    /// must reference device memory valid for the kernel's accesses until
    /// the stream reaches the launch.
    unsafe fn launch_kernel(
        &self,
        func: CUfunction,
        dims: LaunchDims,
        stream: CUstream,
        args: &[KernelArg],
    ) -> CUresult;

    /// `cuMemcpy2DAsync_v2`.
    ///
    /// # Safety
    /// Source and destination described by `copy` must be valid device
    /// allocations covering `Height` rows of `WidthInBytes` at their pitches.
    unsafe fn memcpy_2d_async(&self, copy: &CUDA_MEMCPY2D, stream: CUstream) -> CUresult;

    /// `cuGetErrorName`.
    fn error_name(&self, code: CUresult) -> Option<String>;

    /// `cuGetErrorString`.
    fn error_string(&self, code: CUresult) -> Option<String>;
}

impl fmt::Debug for dyn CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CudaDriver")
    }
}

/// Map a driver result to `Ok(())` or a [`VeneerError::Driver`] that
/// carries the driver's symbolic name and description.
pub fn check_cu(driver: &dyn CudaDriver, result: CUresult, call: &'static str) -> Result<()> {
    if result == CUDA_SUCCESS {
        return Ok(());
    }
    let name = driver
        .error_name(result)
        .unwrap_or_else(|| "CUDA_ERROR_UNKNOWN".to_string());
    let description = driver
        .error_string(result)
        .unwrap_or_else(|| "unknown error".to_string());
    tracing::error!(call, code = result, %name, %description, "CUDA driver call failed");
    Err(VeneerError::Driver {
        call,
        code: result,
        name,
        description,
    })
}
