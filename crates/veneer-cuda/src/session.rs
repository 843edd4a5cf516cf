//! Device session: the overlay module's lifetime and the scoped context
//! guard every device call runs under.
//!
//! # Lifecycle
//!
//! ```text
//! open()   push → cuModuleLoadData → cuModuleGetFunction("Overlay_Cuda") → pop
//! enter()  push ─────────── launches / copies ─────────── pop (guard drop)
//! close()  push → cuModuleUnload → pop            (once; also run by Drop)
//! ```
//!
//! The context stack is balanced on every path, including failures: the
//! pop lives in [`ContextGuard`]'s `Drop`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use veneer_core::device::CudaDeviceContext;
use veneer_core::driver::{CudaDriver, check_cu};
use veneer_core::error::{Result, VeneerError};
use veneer_core::ffi_types::{CUDA_SUCCESS, CUfunction, CUmodule};

use crate::kernels::{KernelImage, OVERLAY_KERNEL};

// ─── Context guard ───────────────────────────────────────────────────────────

/// Keeps a CUDA context current for its lifetime.
pub struct ContextGuard<'a> {
    driver: &'a dyn CudaDriver,
}

impl<'a> ContextGuard<'a> {
    /// Push `device`'s context.  Nothing is popped if the push fails.
    pub fn push(device: &'a CudaDeviceContext) -> Result<Self> {
        let driver = device.driver();
        check_cu(
            driver,
            driver.ctx_push_current(device.cu_ctx()),
            "cuCtxPushCurrent",
        )?;
        Ok(Self { driver })
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let rc = self.driver.ctx_pop_current();
        if rc != CUDA_SUCCESS {
            warn!(code = rc, "cuCtxPopCurrent failed while leaving device scope");
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Loaded overlay module plus the device it lives on.
pub struct DeviceSession {
    device: Option<Arc<CudaDeviceContext>>,
    module: CUmodule,
    function: CUfunction,
}

// SAFETY: module and function handles are only used while the owning
// context is pushed, and `DeviceSession` is never shared mutably.
unsafe impl Send for DeviceSession {}

impl DeviceSession {
    /// Load `image` into `device`'s context and resolve the overlay kernel.
    ///
    /// # Errors
    ///
    /// - [`VeneerError::Driver`] if the context cannot be pushed.
    /// - [`VeneerError::KernelModule`] if the image is rejected or has no
    ///   `Overlay_Cuda` entry point.  A module that was loaded is unloaded
    ///   before returning.
    pub fn open(device: Arc<CudaDeviceContext>, image: &KernelImage) -> Result<Self> {
        if image.is_empty() {
            return Err(VeneerError::KernelModule("empty kernel image".into()));
        }

        let (module, function) = {
            let _scope = ContextGuard::push(&device)?;
            let driver = device.driver();

            let mut module: CUmodule = std::ptr::null_mut();
            let rc = driver.module_load_data(&mut module, image.as_bytes());
            if let Err(err) = check_cu(driver, rc, "cuModuleLoadData") {
                return Err(VeneerError::KernelModule(format!(
                    "failed to load overlay module: {err}"
                )));
            }

            let mut function: CUfunction = std::ptr::null_mut();
            let rc = driver.module_get_function(&mut function, module, OVERLAY_KERNEL);
            if let Err(err) = check_cu(driver, rc, "cuModuleGetFunction") {
                let rc = driver.module_unload(module);
                if rc != CUDA_SUCCESS {
                    warn!(code = rc, "cuModuleUnload failed after entry point lookup error");
                }
                return Err(VeneerError::KernelModule(format!(
                    "failed to load {OVERLAY_KERNEL}: {err}"
                )));
            }
            (module, function)
        };

        info!(
            kernel = OVERLAY_KERNEL,
            image_bytes = image.len(),
            "Overlay module loaded"
        );
        Ok(Self {
            device: Some(device),
            module,
            function,
        })
    }

    /// Make the session's context current until the guard drops.
    pub fn enter(&self) -> Result<ContextGuard<'_>> {
        ContextGuard::push(self.device()?)
    }

    pub fn device(&self) -> Result<&Arc<CudaDeviceContext>> {
        self.device
            .as_ref()
            .ok_or_else(|| VeneerError::InvariantViolation("device session is closed".into()))
    }

    /// Resolved `Overlay_Cuda` handle.
    pub fn function(&self) -> CUfunction {
        self.function
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Unload the module and release the device.  Runs at most once; later
    /// calls are no-ops.
    ///
    /// The session counts as closed even when the unload fails.
    pub fn close(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let module = std::mem::replace(&mut self.module, std::ptr::null_mut());
        self.function = std::ptr::null_mut();
        if module.is_null() {
            return Ok(());
        }

        let _scope = ContextGuard::push(&device)?;
        let driver = device.driver();
        check_cu(driver, driver.module_unload(module), "cuModuleUnload")?;
        debug!("Overlay module unloaded");
        Ok(())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Overlay module teardown failed");
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("open", &self.is_open())
            .field("module", &self.module)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_core::ffi_types::{CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_NOT_FOUND, CUcontext};
    use veneer_core::mock::{DriverCall, MockDriver};

    fn device(driver: &Arc<MockDriver>) -> Arc<CudaDeviceContext> {
        let driver: Arc<dyn CudaDriver> = driver.clone();
        Arc::new(CudaDeviceContext::new(
            driver,
            0x10usize as CUcontext,
            0x20usize as _,
        ))
    }

    fn image() -> KernelImage {
        KernelImage::from_ptx(".version 7.0\n.target sm_52\n")
    }

    #[test]
    fn open_and_close_balance_the_context_stack() {
        let driver = Arc::new(MockDriver::new());
        let mut session = DeviceSession::open(device(&driver), &image()).expect("open");
        assert!(session.is_open());
        assert_eq!(driver.context_depth(), 0);

        session.close().expect("close");
        session.close().expect("second close is a no-op");
        drop(session);

        assert_eq!(driver.context_depth(), 0);
        assert_eq!(driver.count(|c| matches!(c, DriverCall::ModuleLoad { .. })), 1);
        assert_eq!(driver.count(|c| matches!(c, DriverCall::ModuleUnload(_))), 1);
    }

    #[test]
    fn drop_unloads_once() {
        let driver = Arc::new(MockDriver::new());
        drop(DeviceSession::open(device(&driver), &image()).expect("open"));
        assert_eq!(driver.count(|c| matches!(c, DriverCall::ModuleUnload(_))), 1);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn missing_entry_point_unloads_before_returning() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_get_function(CUDA_ERROR_NOT_FOUND);
        let err = DeviceSession::open(device(&driver), &image()).expect_err("no entry point");
        assert!(matches!(err, VeneerError::KernelModule(_)));
        assert!(err.to_string().contains("CUDA_ERROR_NOT_FOUND"));
        assert_eq!(driver.count(|c| matches!(c, DriverCall::ModuleUnload(_))), 1);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn rejected_image_leaves_nothing_loaded() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_module_load(200);
        let err = DeviceSession::open(device(&driver), &image()).expect_err("bad image");
        assert!(err.is_configuration());
        assert_eq!(driver.count(|c| matches!(c, DriverCall::ModuleUnload(_))), 0);
        assert_eq!(driver.context_depth(), 0);
    }

    #[test]
    fn failed_push_does_not_pop() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_push(CUDA_ERROR_INVALID_CONTEXT);
        let err = DeviceSession::open(device(&driver), &image()).expect_err("push");
        assert_eq!(err.cu_result(), Some(CUDA_ERROR_INVALID_CONTEXT));
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Pop)), 0);
    }

    #[test]
    fn guard_pops_on_early_return() {
        let driver = Arc::new(MockDriver::new());
        let session = DeviceSession::open(device(&driver), &image()).expect("open");

        let run = || -> Result<()> {
            let _scope = session.enter()?;
            Err(VeneerError::InvariantViolation("bail".into()))
        };
        assert!(run().is_err());
        assert_eq!(driver.context_depth(), 0);
        assert_eq!(driver.max_context_depth(), 1);
    }
}
