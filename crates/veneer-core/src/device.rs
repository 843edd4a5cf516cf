//! Device and frames contexts attached to GPU-resident links.
//!
//! A [`CudaDeviceContext`] names one native CUDA context, the single stream
//! all overlay work is enqueued on, and the driver table used to reach
//! both.  A [`DeviceFramesContext`] describes the frames flowing on one
//! link: their software format, nominal size, and the pool fresh buffers
//! come from.

use std::fmt;
use std::sync::Arc;

use crate::driver::CudaDriver;
use crate::ffi_types::{CUcontext, CUstream};
use crate::frame::FramePool;
use crate::types::PixelFormat;

/// Native CUDA context + stream + driver table.
pub struct CudaDeviceContext {
    driver: Arc<dyn CudaDriver>,
    cu_ctx: CUcontext,
    stream: CUstream,
}

// SAFETY: CUcontext/CUstream are driver handles usable from any thread as
// long as the context is pushed before use, which every caller does via the
// session guard.  The driver table itself is Send + Sync.
unsafe impl Send for CudaDeviceContext {}
// SAFETY: see above; the handles are never dereferenced on the host.
unsafe impl Sync for CudaDeviceContext {}

impl CudaDeviceContext {
    pub fn new(driver: Arc<dyn CudaDriver>, cu_ctx: CUcontext, stream: CUstream) -> Self {
        Self {
            driver,
            cu_ctx,
            stream,
        }
    }

    pub fn driver(&self) -> &dyn CudaDriver {
        self.driver.as_ref()
    }

    pub fn cu_ctx(&self) -> CUcontext {
        self.cu_ctx
    }

    pub fn stream(&self) -> CUstream {
        self.stream
    }
}

impl fmt::Debug for CudaDeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDeviceContext")
            .field("cu_ctx", &self.cu_ctx)
            .field("stream", &self.stream)
            .finish()
    }
}

/// Hardware frames context of one link.
pub struct DeviceFramesContext {
    device: Arc<CudaDeviceContext>,
    pub sw_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pool: Option<Arc<dyn FramePool>>,
}

impl DeviceFramesContext {
    pub fn new(
        device: Arc<CudaDeviceContext>,
        sw_format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            device,
            sw_format,
            width,
            height,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn FramePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn device(&self) -> &Arc<CudaDeviceContext> {
        &self.device
    }

    pub fn pool(&self) -> Option<&Arc<dyn FramePool>> {
        self.pool.as_ref()
    }
}

impl fmt::Debug for DeviceFramesContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFramesContext")
            .field("device", &self.device)
            .field("sw_format", &self.sw_format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
