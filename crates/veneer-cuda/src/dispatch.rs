//! Plane compositor: turns one `(main, overlay, offset)` triple into the
//! kernel launches of its [`PlanePlan`].

use tracing::{debug, trace};

use veneer_core::driver::check_cu;
use veneer_core::error::{Result, VeneerError};
use veneer_core::ffi_types::CUDA_MEMCPY2D;
use veneer_core::frame::{DevicePlane, GpuFrame};

use crate::kernels::{OverlayLaunch, launch_config_2d};
use crate::planes::{OverlayOffset, PlanePlan, PlaneStep};
use crate::session::DeviceSession;

/// Issues the per-plane overlay launches for one format pair.
#[derive(Clone, Debug)]
pub struct PlaneCompositor {
    plan: PlanePlan,
}

impl PlaneCompositor {
    pub fn new(plan: PlanePlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &PlanePlan {
        &self.plan
    }

    /// Blend `overlay` into `main` at `offset`.
    ///
    /// `main` is made exclusively owned first (copy-on-write through its
    /// frames context's pool).  All launches run under one context scope; the
    /// first failing launch aborts the remaining planes.
    ///
    /// Returns the number of launches issued.
    pub fn composite(
        &self,
        session: &DeviceSession,
        main: &mut GpuFrame,
        overlay: &GpuFrame,
        offset: OverlayOffset,
    ) -> Result<usize> {
        if main.format != self.plan.main_format() || overlay.format != self.plan.overlay_format() {
            return Err(VeneerError::InvalidPairing(format!(
                "planned {} over {}, got {} over {}",
                self.plan.overlay_format(),
                self.plan.main_format(),
                overlay.format,
                main.format
            )));
        }

        make_writable(session, main)?;

        let device = session.device()?;
        let driver = device.driver();
        let _scope = session.enter()?;

        for step in self.plan.steps() {
            let (dims, launch) = {
                let main_plane = plane_of(main, step.plane, "main")?;
                let launch = self.launch_for(step, main_plane, overlay, offset)?;
                (launch_config_2d(main_plane.row_bytes, main_plane.rows), launch)
            };
            trace!(plane = step.plane, ?dims, ?launch, "Overlay_Cuda launch");
            // SAFETY: the function handle belongs to the session's module,
            // which is loaded for as long as `session` is borrowed; every
            // pointer argument is a plane of a live frame.
            let rc = unsafe {
                driver.launch_kernel(
                    session.function(),
                    dims,
                    device.stream(),
                    &launch.to_args(),
                )
            };
            check_cu(driver, rc, "cuLaunchKernel")?;
        }

        Ok(self.plan.launches())
    }

    fn launch_for(
        &self,
        step: &PlaneStep,
        main_plane: &DevicePlane,
        overlay: &GpuFrame,
        offset: OverlayOffset,
    ) -> Result<OverlayLaunch> {
        let overlay_plane = plane_of(overlay, step.plane, "overlay")?;
        let (x, y) = step.offset(offset);
        let (ow, oh) = step.overlay_extent(overlay.width, overlay.height);
        let overlay_w = visible_extent(ow, x, main_plane.row_bytes);
        let overlay_h = visible_extent(oh, y, main_plane.rows);

        let (alpha_ptr, alpha_stride) = match step.alpha_plane {
            Some(index) => {
                let alpha = plane_of(overlay, index, "overlay alpha")?;
                (alpha.ptr, stride(alpha.pitch)?)
            }
            None => (0, 0),
        };

        Ok(OverlayLaunch {
            x,
            y,
            main_ptr: main_plane.ptr,
            main_stride: stride(main_plane.pitch)?,
            overlay_ptr: overlay_plane.ptr,
            overlay_stride: stride(overlay_plane.pitch)?,
            overlay_w,
            overlay_h,
            alpha_ptr,
            alpha_stride,
            align_x: step.alpha_align.0,
            align_y: step.alpha_align.1,
        })
    }
}

/// Clamp an overlay extent to what lies inside a plane of `limit` samples
/// when placed at `origin`.
fn visible_extent(extent: i32, origin: i32, limit: usize) -> i32 {
    let room = limit as i64 - origin as i64;
    (extent as i64).min(room).max(0) as i32
}

fn stride(pitch: usize) -> Result<i32> {
    i32::try_from(pitch)
        .map_err(|_| VeneerError::InvariantViolation(format!("plane pitch {pitch} exceeds i32")))
}

fn plane_of<'f>(frame: &'f GpuFrame, index: usize, what: &str) -> Result<&'f DevicePlane> {
    frame.plane(index).ok_or_else(|| {
        VeneerError::InvariantViolation(format!(
            "{what} frame ({}) has no plane {index}",
            frame.format
        ))
    })
}

/// Ensure `frame` holds the only reference to its buffer.
///
/// A shared frame gets a fresh buffer from its frames context's pool, filled
/// with device-to-device copies of every plane on the session stream.
/// Returns whether a copy was made.
pub fn make_writable(session: &DeviceSession, frame: &mut GpuFrame) -> Result<bool> {
    if frame.is_writable() {
        return Ok(false);
    }

    let pool = frame
        .frames_ctx
        .as_ref()
        .and_then(|ctx| ctx.pool().cloned())
        .ok_or_else(|| {
            VeneerError::Pool("shared main frame has no frames pool to copy into".into())
        })?;
    let fresh = pool.acquire()?;

    let device = session.device()?;
    let driver = device.driver();
    {
        let _scope = session.enter()?;
        for (index, src) in frame.buffer().planes().iter().enumerate() {
            let dst = fresh.plane(index).ok_or_else(|| {
                VeneerError::Pool(format!("pooled buffer is missing plane {index}"))
            })?;
            if dst.row_bytes < src.row_bytes || dst.rows < src.rows {
                return Err(VeneerError::Pool(format!(
                    "pooled plane {index} is {}x{}, frame needs {}x{}",
                    dst.row_bytes, dst.rows, src.row_bytes, src.rows
                )));
            }
            let copy = CUDA_MEMCPY2D::device_to_device(
                src.ptr,
                src.pitch,
                dst.ptr,
                dst.pitch,
                src.row_bytes,
                src.rows,
            );
            // SAFETY: both planes are live device allocations of at least
            // `rows` rows of `row_bytes` at their pitches.
            let rc = unsafe { driver.memcpy_2d_async(&copy, device.stream()) };
            check_cu(driver, rc, "cuMemcpy2DAsync")?;
        }
    }

    frame.replace_buffer(fresh);
    debug!(format = %frame.format, "Copied shared main frame before overlay");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_extent_clamps_to_plane() {
        assert_eq!(visible_extent(64, 10, 1920), 64);
        assert_eq!(visible_extent(64, 1900, 1920), 20);
        assert_eq!(visible_extent(64, 1920, 1920), 0);
        assert_eq!(visible_extent(64, -32, 1920), 64);
        assert_eq!(visible_extent(64, i32::MAX, 1920), 0);
        assert_eq!(visible_extent(64, i32::MAX / 2, 960), 0);
    }
}
