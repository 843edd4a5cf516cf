//! CUDA driver function table resolved at runtime.
//!
//! On Linux the driver is `dlopen`ed (`libcuda.so.1`, then `libcuda.so`)
//! the first time a table is requested, so building and unit-testing never
//! require an NVIDIA driver.  Elsewhere the symbols are linked directly and
//! the table is filled with their addresses.

use std::ffi::{CStr, CString, c_char, c_void};
use std::os::raw::c_uint;
use std::sync::{Arc, OnceLock};

use veneer_core::driver::{CudaDriver, KernelArg, LaunchDims};
use veneer_core::error::{Result, VeneerError};
use veneer_core::ffi_types::{
    CUDA_MEMCPY2D, CUDA_SUCCESS, CUcontext, CUfunction, CUmodule, CUresult, CUstream,
};

#[cfg(not(target_os = "linux"))]
#[allow(non_snake_case)]
unsafe extern "C" {
    fn cuCtxPushCurrent_v2(ctx: CUcontext) -> CUresult;
    fn cuCtxPopCurrent_v2(pctx: *mut CUcontext) -> CUresult;
    fn cuModuleLoadData(module: *mut CUmodule, image: *const c_void) -> CUresult;
    fn cuModuleUnload(hmod: CUmodule) -> CUresult;
    fn cuModuleGetFunction(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char)
    -> CUresult;
    fn cuLaunchKernel(
        f: CUfunction,
        gridDimX: c_uint,
        gridDimY: c_uint,
        gridDimZ: c_uint,
        blockDimX: c_uint,
        blockDimY: c_uint,
        blockDimZ: c_uint,
        sharedMemBytes: c_uint,
        hStream: CUstream,
        kernelParams: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult;
    fn cuMemcpy2DAsync_v2(pCopy: *const CUDA_MEMCPY2D, hStream: CUstream) -> CUresult;
    fn cuGetErrorName(error: CUresult, pStr: *mut *const c_char) -> CUresult;
    fn cuGetErrorString(error: CUresult, pStr: *mut *const c_char) -> CUresult;
}

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
    fn dlerror() -> *const c_char;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

#[cfg(target_os = "linux")]
const RTLD_NOW: i32 = 2;
#[cfg(target_os = "linux")]
const RTLD_GLOBAL: i32 = 0x100;

type LaunchKernelFn = unsafe extern "C" fn(
    CUfunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    CUstream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CUresult;

struct CudaDriverApi {
    cu_ctx_push_current: unsafe extern "C" fn(CUcontext) -> CUresult,
    cu_ctx_pop_current: unsafe extern "C" fn(*mut CUcontext) -> CUresult,
    cu_module_load_data: unsafe extern "C" fn(*mut CUmodule, *const c_void) -> CUresult,
    cu_module_unload: unsafe extern "C" fn(CUmodule) -> CUresult,
    cu_module_get_function:
        unsafe extern "C" fn(*mut CUfunction, CUmodule, *const c_char) -> CUresult,
    cu_launch_kernel: LaunchKernelFn,
    cu_memcpy_2d_async: unsafe extern "C" fn(*const CUDA_MEMCPY2D, CUstream) -> CUresult,
    cu_get_error_name: unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult,
    cu_get_error_string: unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult,
}

static CUDA_DRIVER_API: OnceLock<std::result::Result<CudaDriverApi, String>> = OnceLock::new();

#[cfg(target_os = "linux")]
fn last_dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns a thread-local C string or null.
    unsafe {
        let p = dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

#[cfg(target_os = "linux")]
fn load_cuda_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid CUDA symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname is a valid C symbol name.
    let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!(
            "dlsym({name}) failed: {}",
            last_dl_error("unknown dlsym error")
        ))
    } else {
        // SAFETY: ptr points to a function whose signature is T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

#[cfg(target_os = "linux")]
fn init_cuda_driver_api() -> std::result::Result<CudaDriverApi, String> {
    let mut handle = std::ptr::null_mut();
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in ["libcuda.so.1", "libcuda.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid CUDA soname: {candidate}"))?;
        // SAFETY: static soname and valid dlopen flags.
        handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_GLOBAL) };
        if !handle.is_null() {
            break;
        }
        last_err = last_dl_error("unknown dlopen error");
    }

    if handle.is_null() {
        return Err(format!(
            "dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"
        ));
    }

    Ok(CudaDriverApi {
        cu_ctx_push_current: load_cuda_symbol(handle, "cuCtxPushCurrent_v2")?,
        cu_ctx_pop_current: load_cuda_symbol(handle, "cuCtxPopCurrent_v2")?,
        cu_module_load_data: load_cuda_symbol(handle, "cuModuleLoadData")?,
        cu_module_unload: load_cuda_symbol(handle, "cuModuleUnload")?,
        cu_module_get_function: load_cuda_symbol(handle, "cuModuleGetFunction")?,
        cu_launch_kernel: load_cuda_symbol(handle, "cuLaunchKernel")?,
        cu_memcpy_2d_async: load_cuda_symbol(handle, "cuMemcpy2DAsync_v2")?,
        cu_get_error_name: load_cuda_symbol(handle, "cuGetErrorName")?,
        cu_get_error_string: load_cuda_symbol(handle, "cuGetErrorString")?,
    })
}

#[cfg(not(target_os = "linux"))]
fn init_cuda_driver_api() -> std::result::Result<CudaDriverApi, String> {
    Ok(CudaDriverApi {
        cu_ctx_push_current: cuCtxPushCurrent_v2,
        cu_ctx_pop_current: cuCtxPopCurrent_v2,
        cu_module_load_data: cuModuleLoadData,
        cu_module_unload: cuModuleUnload,
        cu_module_get_function: cuModuleGetFunction,
        cu_launch_kernel: cuLaunchKernel,
        cu_memcpy_2d_async: cuMemcpy2DAsync_v2,
        cu_get_error_name: cuGetErrorName,
        cu_get_error_string: cuGetErrorString,
    })
}

fn cuda_driver_api() -> Result<&'static CudaDriverApi> {
    let api = CUDA_DRIVER_API.get_or_init(init_cuda_driver_api);
    api.as_ref().map_err(|err| {
        VeneerError::DriverUnavailable(format!(
            "failed to load CUDA driver API: {err}. \
Ensure NVIDIA driver libraries are installed and visible via LD_LIBRARY_PATH \
(on WSL, prepend /usr/lib/wsl/lib)."
        ))
    })
}

/// Production [`CudaDriver`] backed by the process-wide symbol table.
pub struct DynamicDriver {
    api: &'static CudaDriverApi,
}

impl DynamicDriver {
    /// Resolve the driver table (once per process) and wrap it.
    pub fn load() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            api: cuda_driver_api()?,
        }))
    }

    fn describe(
        &self,
        code: CUresult,
        f: unsafe extern "C" fn(CUresult, *mut *const c_char) -> CUresult,
    ) -> Option<String> {
        let mut p: *const c_char = std::ptr::null();
        // SAFETY: p is a valid out-pointer; the driver writes a static string.
        let rc = unsafe { f(code, &mut p) };
        if rc != CUDA_SUCCESS || p.is_null() {
            return None;
        }
        // SAFETY: driver-owned, NUL-terminated, static lifetime.
        Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().to_string())
    }
}

impl std::fmt::Debug for DynamicDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DynamicDriver")
    }
}

/// Kernel parameter storage in declaration order.
///
/// `cuLaunchKernel` takes `void**` pointing at each argument value; values
/// live in typed vectors so the pointers stay valid for the call.
struct ArgStorage {
    ptrs: Vec<u64>,
    ints: Vec<i32>,
    order: Vec<ArgSlot>,
}

#[derive(Clone, Copy)]
enum ArgSlot {
    Ptr(usize),
    Int(usize),
}

impl ArgStorage {
    fn from_args(args: &[KernelArg]) -> Self {
        let mut storage = Self {
            ptrs: Vec::new(),
            ints: Vec::new(),
            order: Vec::with_capacity(args.len()),
        };
        for arg in args {
            match *arg {
                KernelArg::Ptr(p) => {
                    storage.order.push(ArgSlot::Ptr(storage.ptrs.len()));
                    storage.ptrs.push(p);
                }
                KernelArg::I32(v) => {
                    storage.order.push(ArgSlot::Int(storage.ints.len()));
                    storage.ints.push(v);
                }
            }
        }
        storage
    }

    fn as_void_ptrs(&mut self) -> Vec<*mut c_void> {
        self.order
            .iter()
            .map(|slot| match *slot {
                ArgSlot::Ptr(i) => (&mut self.ptrs[i]) as *mut u64 as *mut c_void,
                ArgSlot::Int(i) => (&mut self.ints[i]) as *mut i32 as *mut c_void,
            })
            .collect()
    }
}

impl CudaDriver for DynamicDriver {
    fn ctx_push_current(&self, ctx: CUcontext) -> CUresult {
        // SAFETY: resolved driver symbol; ctx validity is the caller's contract.
        unsafe { (self.api.cu_ctx_push_current)(ctx) }
    }

    fn ctx_pop_current(&self) -> CUresult {
        let mut dummy: CUcontext = std::ptr::null_mut();
        // SAFETY: dummy is a valid out-pointer.
        unsafe { (self.api.cu_ctx_pop_current)(&mut dummy) }
    }

    fn module_load_data(&self, module: &mut CUmodule, image: &[u8]) -> CUresult {
        // SAFETY: image outlives the call; the driver copies what it needs.
        unsafe { (self.api.cu_module_load_data)(module, image.as_ptr() as *const c_void) }
    }

    fn module_unload(&self, module: CUmodule) -> CUresult {
        // SAFETY: module came from cuModuleLoadData and is unloaded once.
        unsafe { (self.api.cu_module_unload)(module) }
    }

    fn module_get_function(
        &self,
        func: &mut CUfunction,
        module: CUmodule,
        name: &str,
    ) -> CUresult {
        let Ok(cname) = CString::new(name) else {
            return veneer_core::ffi_types::CUDA_ERROR_INVALID_VALUE;
        };
        // SAFETY: func is a valid out-pointer, cname is NUL-terminated.
        unsafe { (self.api.cu_module_get_function)(func, module, cname.as_ptr()) }
    }

    unsafe fn launch_kernel(
        &self,
        func: CUfunction,
        dims: LaunchDims,
        stream: CUstream,
        args: &[KernelArg],
    ) -> CUresult {
        let mut storage = ArgStorage::from_args(args);
        let mut params = storage.as_void_ptrs();
        // SAFETY: params points into `storage`, alive for the call; the
        // driver copies argument values before returning.
        unsafe {
            (self.api.cu_launch_kernel)(
                func,
                dims.grid.0,
                dims.grid.1,
                dims.grid.2,
                dims.block.0,
                dims.block.1,
                dims.block.2,
                dims.shared_mem_bytes,
                stream,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        }
    }

    unsafe fn memcpy_2d_async(&self, copy: &CUDA_MEMCPY2D, stream: CUstream) -> CUresult {
        // SAFETY: copy descriptor validity is the caller's contract.
        unsafe { (self.api.cu_memcpy_2d_async)(copy, stream) }
    }

    fn error_name(&self, code: CUresult) -> Option<String> {
        self.describe(code, self.api.cu_get_error_name)
    }

    fn error_string(&self, code: CUresult) -> Option<String> {
        self.describe(code, self.api.cu_get_error_string)
    }
}
