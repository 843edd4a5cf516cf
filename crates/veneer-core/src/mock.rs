//! Recording driver and frame pool for GPU-less runs.
//!
//! [`MockDriver`] implements the full [`CudaDriver`] table without touching
//! a device: every call is appended to a log, the context stack depth is
//! tracked, and individual calls can be made to fail.  [`MockPool`] hands
//! out synthetic pitched buffers at increasing fake device addresses.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::driver::{CudaDriver, KernelArg, LaunchDims};
use crate::error::{Result, VeneerError};
use crate::ffi_types::{
    CUDA_MEMCPY2D, CUDA_SUCCESS, CUcontext, CUdeviceptr, CUfunction, CUmodule, CUresult, CUstream,
};
use crate::frame::{DeviceBuffer, FramePool};
use crate::types::PixelFormat;

const MOCK_MODULE: usize = 0x0D0D_0000;
const MOCK_FUNCTION: usize = 0x0F0F_0000;

/// One recorded kernel launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedLaunch {
    pub function: usize,
    pub dims: LaunchDims,
    pub stream: usize,
    pub args: Vec<KernelArg>,
}

/// One recorded driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Push(usize),
    Pop,
    ModuleLoad { image_len: usize },
    ModuleUnload(usize),
    GetFunction(String),
    Launch(RecordedLaunch),
    Memcpy2d {
        src: CUdeviceptr,
        dst: CUdeviceptr,
        width_in_bytes: usize,
        height: usize,
    },
}

#[derive(Default)]
struct Faults {
    push: Option<CUresult>,
    module_load: Option<CUresult>,
    get_function: Option<CUresult>,
    launch_at: Option<(usize, CUresult)>,
    memcpy: Option<CUresult>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<DriverCall>,
    depth: i64,
    max_depth: i64,
    launches: usize,
    faults: Faults,
}

/// In-memory [`CudaDriver`] that records calls instead of issuing them.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Make every `cuCtxPushCurrent` fail with `code`.
    pub fn fail_push(&self, code: CUresult) {
        self.with_state(|s| s.faults.push = Some(code));
    }

    /// Make `cuModuleLoadData` fail with `code`.
    pub fn fail_module_load(&self, code: CUresult) {
        self.with_state(|s| s.faults.module_load = Some(code));
    }

    /// Make `cuModuleGetFunction` fail with `code`.
    pub fn fail_get_function(&self, code: CUresult) {
        self.with_state(|s| s.faults.get_function = Some(code));
    }

    /// Make the `index`-th launch (0-based, counted over the driver's
    /// lifetime) fail with `code`.
    pub fn fail_launch_at(&self, index: usize, code: CUresult) {
        self.with_state(|s| s.faults.launch_at = Some((index, code)));
    }

    /// Make `cuMemcpy2DAsync` fail with `code`.
    pub fn fail_memcpy(&self, code: CUresult) {
        self.with_state(|s| s.faults.memcpy = Some(code));
    }

    /// Remove all injected failures.
    pub fn clear_faults(&self) {
        self.with_state(|s| s.faults = Faults::default());
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    DriverCall::Launch(l) => Some(l.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    /// Current push depth; zero when the context stack is balanced.
    pub fn context_depth(&self) -> i64 {
        self.with_state(|s| s.depth)
    }

    pub fn max_context_depth(&self) -> i64 {
        self.with_state(|s| s.max_depth)
    }

    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }
}

impl CudaDriver for MockDriver {
    fn ctx_push_current(&self, ctx: CUcontext) -> CUresult {
        self.with_state(|s| {
            if let Some(code) = s.faults.push {
                return code;
            }
            s.calls.push(DriverCall::Push(ctx as usize));
            s.depth += 1;
            s.max_depth = s.max_depth.max(s.depth);
            CUDA_SUCCESS
        })
    }

    fn ctx_pop_current(&self) -> CUresult {
        self.with_state(|s| {
            s.calls.push(DriverCall::Pop);
            s.depth -= 1;
            CUDA_SUCCESS
        })
    }

    fn module_load_data(&self, module: &mut CUmodule, image: &[u8]) -> CUresult {
        self.with_state(|s| {
            s.calls.push(DriverCall::ModuleLoad {
                image_len: image.len(),
            });
            if let Some(code) = s.faults.module_load {
                return code;
            }
            *module = MOCK_MODULE as *mut c_void;
            CUDA_SUCCESS
        })
    }

    fn module_unload(&self, module: CUmodule) -> CUresult {
        self.with_state(|s| {
            s.calls.push(DriverCall::ModuleUnload(module as usize));
            CUDA_SUCCESS
        })
    }

    fn module_get_function(
        &self,
        func: &mut CUfunction,
        _module: CUmodule,
        name: &str,
    ) -> CUresult {
        self.with_state(|s| {
            s.calls.push(DriverCall::GetFunction(name.to_string()));
            if let Some(code) = s.faults.get_function {
                return code;
            }
            *func = MOCK_FUNCTION as *mut c_void;
            CUDA_SUCCESS
        })
    }

    unsafe fn launch_kernel(
        &self,
        func: CUfunction,
        dims: LaunchDims,
        stream: CUstream,
        args: &[KernelArg],
    ) -> CUresult {
        self.with_state(|s| {
            let index = s.launches;
            s.launches += 1;
            if let Some((at, code)) = s.faults.launch_at {
                if at == index {
                    return code;
                }
            }
            s.calls.push(DriverCall::Launch(RecordedLaunch {
                function: func as usize,
                dims,
                stream: stream as usize,
                args: args.to_vec(),
            }));
            CUDA_SUCCESS
        })
    }

    unsafe fn memcpy_2d_async(&self, copy: &CUDA_MEMCPY2D, _stream: CUstream) -> CUresult {
        self.with_state(|s| {
            if let Some(code) = s.faults.memcpy {
                return code;
            }
            s.calls.push(DriverCall::Memcpy2d {
                src: copy.srcDevice,
                dst: copy.dstDevice,
                width_in_bytes: copy.WidthInBytes,
                height: copy.Height,
            });
            CUDA_SUCCESS
        })
    }

    fn error_name(&self, code: CUresult) -> Option<String> {
        Some(
            match code {
                1 => "CUDA_ERROR_INVALID_VALUE",
                200 => "CUDA_ERROR_INVALID_IMAGE",
                201 => "CUDA_ERROR_INVALID_CONTEXT",
                500 => "CUDA_ERROR_NOT_FOUND",
                719 => "CUDA_ERROR_LAUNCH_FAILED",
                _ => "CUDA_ERROR_UNKNOWN",
            }
            .to_string(),
        )
    }

    fn error_string(&self, code: CUresult) -> Option<String> {
        Some(format!("mock driver error {code}"))
    }
}

/// Frame pool handing out synthetic contiguous buffers.
pub struct MockPool {
    format: PixelFormat,
    width: u32,
    height: u32,
    next_base: AtomicU64,
    acquired: AtomicUsize,
    outstanding: Arc<AtomicUsize>,
}

/// Returns its buffer to the pool count when dropped.
struct PoolLease(Arc<AtomicUsize>);

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MockPool {
    /// Fake device addresses start at this value and grow per buffer.
    pub const BASE: CUdeviceptr = 0x7000_0000;

    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            next_base: AtomicU64::new(Self::BASE),
            acquired: AtomicUsize::new(0),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Buffers handed out so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Buffers handed out and still referenced by some frame.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl FramePool for MockPool {
    fn acquire(&self) -> Result<DeviceBuffer> {
        if self.width == 0 || self.height == 0 {
            return Err(VeneerError::Pool("pool has zero-sized frames".into()));
        }
        let buf = DeviceBuffer::contiguous(0, self.format, self.width, self.height, 256);
        let size: usize = buf.planes().iter().map(|p| p.pitch * p.rows).sum();
        let base = self.next_base.fetch_add(size as u64, Ordering::Relaxed);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let planes = DeviceBuffer::contiguous(base, self.format, self.width, self.height, 256)
            .planes()
            .to_vec();
        Ok(DeviceBuffer::with_lease(
            planes,
            PoolLease(Arc::clone(&self.outstanding)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_depth_is_tracked() {
        let driver = MockDriver::new();
        assert_eq!(driver.ctx_push_current(0x10usize as CUcontext), CUDA_SUCCESS);
        assert_eq!(driver.context_depth(), 1);
        assert_eq!(driver.ctx_pop_current(), CUDA_SUCCESS);
        assert_eq!(driver.context_depth(), 0);
        assert_eq!(driver.max_context_depth(), 1);
    }

    #[test]
    fn injected_launch_failure_hits_only_that_launch() {
        let driver = MockDriver::new();
        driver.fail_launch_at(1, 719);
        let dims = LaunchDims {
            grid: (1, 1, 1),
            block: (32, 16, 1),
            shared_mem_bytes: 0,
        };
        // SAFETY: the mock never dereferences handles or pointers.
        let rcs: Vec<CUresult> = (0..3)
            .map(|_| unsafe {
                driver.launch_kernel(std::ptr::null_mut(), dims, std::ptr::null_mut(), &[])
            })
            .collect();
        assert_eq!(rcs, vec![CUDA_SUCCESS, 719, CUDA_SUCCESS]);
        assert_eq!(driver.launches().len(), 2);
    }

    #[test]
    fn pool_buffers_do_not_overlap() {
        let pool = MockPool::new(PixelFormat::Nv12, 64, 32);
        let a = pool.acquire().expect("first buffer");
        let b = pool.acquire().expect("second buffer");
        let a_end = a.planes()[1].ptr + (a.planes()[1].pitch * a.planes()[1].rows) as u64;
        assert!(b.planes()[0].ptr >= a_end);
        assert_eq!(pool.acquired(), 2);
    }
}
