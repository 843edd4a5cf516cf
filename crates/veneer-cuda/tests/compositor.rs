use std::sync::Arc;

use veneer_core::device::{CudaDeviceContext, DeviceFramesContext};
use veneer_core::driver::CudaDriver;
use veneer_core::error::VeneerError;
use veneer_core::ffi_types::{CUDA_ERROR_LAUNCH_FAILED, CUcontext, CUstream};
use veneer_core::frame::{DeviceBuffer, GpuFrame};
use veneer_core::mock::{DriverCall, MockDriver, MockPool};
use veneer_core::types::PixelFormat;
use veneer_cuda::{
    DeviceSession, KernelImage, OverlayLaunch, OverlayOffset, PlaneCompositor, XPosition,
    check_formats,
};

const STREAM: usize = 0x5757;

struct Rig {
    driver: Arc<MockDriver>,
    device: Arc<CudaDeviceContext>,
    session: DeviceSession,
}

fn rig() -> Rig {
    let driver = Arc::new(MockDriver::new());
    let table: Arc<dyn CudaDriver> = driver.clone();
    let device = Arc::new(CudaDeviceContext::new(
        table,
        0x10usize as CUcontext,
        STREAM as CUstream,
    ));
    let session = DeviceSession::open(
        Arc::clone(&device),
        &KernelImage::from_ptx(".version 7.0\n.target sm_52\n"),
    )
    .expect("session opens on the mock driver");
    driver.clear_calls();
    Rig {
        driver,
        device,
        session,
    }
}

fn frame(base: u64, format: PixelFormat, width: u32, height: u32) -> GpuFrame {
    GpuFrame::new(
        DeviceBuffer::contiguous(base, format, width, height, 256),
        format,
        width,
        height,
    )
}

fn decoded(driver: &MockDriver) -> Vec<OverlayLaunch> {
    driver
        .launches()
        .iter()
        .map(|l| OverlayLaunch::decode(&l.args).expect("12 kernel arguments"))
        .collect()
}

#[test]
fn nv12_pair_issues_two_launches() {
    let rig = rig();
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let mut main = frame(0x1000_0000, PixelFormat::Nv12, 1920, 1080);
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 64, 64);

    let n = compositor
        .composite(
            &rig.session,
            &mut main,
            &overlay,
            OverlayOffset::new(XPosition::Aligned(10), 10),
        )
        .expect("composite");
    assert_eq!(n, 2);

    let records = rig.driver.launches();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.stream == STREAM));
    assert!(records.iter().all(|r| r.dims.block == (32, 16, 1)));
    assert_eq!(records[0].dims.grid, (60, 68, 1));
    // 960x540 interleaved chroma pairs = 1920x540 bytes.
    assert_eq!(records[1].dims.grid, (60, 34, 1));

    let launches = decoded(&rig.driver);
    let luma = launches[0];
    assert_eq!((luma.x, luma.y), (10, 10));
    assert_eq!((luma.overlay_w, luma.overlay_h), (64, 64));
    assert_eq!(luma.main_ptr, main.plane(0).expect("y").ptr);
    assert_eq!(luma.align_x, 1);
    assert!(!luma.has_alpha());

    let chroma = launches[1];
    assert_eq!((chroma.x, chroma.y), (10, 5));
    assert_eq!((chroma.overlay_w, chroma.overlay_h), (64, 32));
    assert_eq!(chroma.main_ptr, main.plane(1).expect("uv").ptr);
    assert_eq!(chroma.overlay_ptr, overlay.plane(1).expect("uv").ptr);
    assert_eq!((chroma.alpha_ptr, chroma.alpha_stride), (0, 0));
    assert_eq!((chroma.align_x, chroma.align_y), (0, 0));

    assert_eq!(rig.driver.context_depth(), 0);
}

#[test]
fn alpha_overlay_binds_alpha_on_every_plane() {
    let rig = rig();
    let compositor = PlaneCompositor::new(
        check_formats(PixelFormat::Yuv420p, PixelFormat::Yuva420p).expect("plan"),
    );
    let mut main = frame(0x1000_0000, PixelFormat::Yuv420p, 1280, 720);
    let overlay = frame(0x2000_0000, PixelFormat::Yuva420p, 100, 50);
    let alpha = *overlay.plane(3).expect("alpha plane");

    compositor
        .composite(
            &rig.session,
            &mut main,
            &overlay,
            OverlayOffset::new(XPosition::Aligned(100), 101),
        )
        .expect("composite");

    let launches = decoded(&rig.driver);
    assert_eq!(launches.len(), 3);
    assert_eq!((launches[0].x, launches[0].y), (100, 101));
    assert_eq!((launches[0].align_x, launches[0].align_y), (1, 1));
    for chroma in &launches[1..] {
        assert_eq!((chroma.x, chroma.y), (50, 50));
        assert_eq!((chroma.overlay_w, chroma.overlay_h), (50, 25));
        assert_eq!((chroma.align_x, chroma.align_y), (2, 2));
    }
    for launch in &launches {
        assert_eq!(launch.alpha_ptr, alpha.ptr);
        assert_eq!(launch.alpha_stride, alpha.pitch as i32);
    }
    assert_eq!(launches[1].main_ptr, main.plane(1).expect("u").ptr);
    assert_eq!(launches[2].main_ptr, main.plane(2).expect("v").ptr);
}

#[test]
fn opaque_planar_overlay_passes_null_alpha() {
    let rig = rig();
    let compositor = PlaneCompositor::new(
        check_formats(PixelFormat::Yuv420p, PixelFormat::Yuv420p).expect("plan"),
    );
    let mut main = frame(0x1000_0000, PixelFormat::Yuv420p, 640, 360);
    let overlay = frame(0x2000_0000, PixelFormat::Yuv420p, 64, 64);

    compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect("composite");

    let launches = decoded(&rig.driver);
    assert_eq!(launches.len(), 3);
    assert!(launches.iter().all(|l| l.alpha_ptr == 0 && l.alpha_stride == 0));
    assert_eq!((launches[1].align_x, launches[1].align_y), (2, 2));
}

#[test]
fn launch_failure_aborts_remaining_planes_and_pops() {
    let rig = rig();
    rig.driver.fail_launch_at(1, CUDA_ERROR_LAUNCH_FAILED);
    let compositor = PlaneCompositor::new(
        check_formats(PixelFormat::Yuv420p, PixelFormat::Yuv420p).expect("plan"),
    );
    let mut main = frame(0x1000_0000, PixelFormat::Yuv420p, 640, 360);
    let overlay = frame(0x2000_0000, PixelFormat::Yuv420p, 64, 64);

    let err = compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect_err("second launch fails");
    assert_eq!(err.cu_result(), Some(CUDA_ERROR_LAUNCH_FAILED));
    assert!(err.to_string().contains("CUDA_ERROR_LAUNCH_FAILED"));
    assert_eq!(rig.driver.launches().len(), 1, "plane 2 must not launch");
    assert_eq!(rig.driver.context_depth(), 0);
}

#[test]
fn unset_x_draws_nothing() {
    let rig = rig();
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let mut main = frame(0x1000_0000, PixelFormat::Nv12, 320, 240);
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);

    compositor
        .composite(
            &rig.session,
            &mut main,
            &overlay,
            OverlayOffset::new(XPosition::Unset, 4),
        )
        .expect("composite");
    let launches = decoded(&rig.driver);
    assert_eq!(launches[0].x, i32::MAX);
    assert!(launches.iter().all(|l| l.overlay_w == 0));
}

#[test]
fn shared_main_is_copied_before_blending() {
    let rig = rig();
    let pool = Arc::new(MockPool::new(PixelFormat::Nv12, 320, 240));
    let frames_ctx = Arc::new(
        DeviceFramesContext::new(Arc::clone(&rig.device), PixelFormat::Nv12, 320, 240)
            .with_pool(pool.clone()),
    );
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let original = frame(0x1000_0000, PixelFormat::Nv12, 320, 240).with_frames_ctx(frames_ctx);
    let mut main = original.clone();
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);

    compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect("composite");

    assert!(!main.shares_buffer_with(&original));
    assert_eq!(pool.acquired(), 1);
    assert_eq!(
        rig.driver
            .count(|c| matches!(c, DriverCall::Memcpy2d { .. })),
        2
    );
    let launches = decoded(&rig.driver);
    assert!(launches[0].main_ptr >= MockPool::BASE);
    assert_ne!(launches[0].main_ptr, original.plane(0).expect("y").ptr);
    assert_eq!(rig.driver.context_depth(), 0);

    assert_eq!(pool.outstanding(), 1);
    drop(main);
    assert_eq!(pool.outstanding(), 0, "the copy goes back to the pool");
}

#[test]
fn failed_copy_leaves_the_shared_main_untouched() {
    let rig = rig();
    let pool = Arc::new(MockPool::new(PixelFormat::Nv12, 320, 240));
    let frames_ctx = Arc::new(
        DeviceFramesContext::new(Arc::clone(&rig.device), PixelFormat::Nv12, 320, 240)
            .with_pool(pool.clone()),
    );
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let original = frame(0x1000_0000, PixelFormat::Nv12, 320, 240).with_frames_ctx(frames_ctx);
    let mut main = original.clone();
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);

    rig.driver.fail_memcpy(CUDA_ERROR_LAUNCH_FAILED);
    let err = compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect_err("copy fails");
    assert_eq!(err.cu_result(), Some(CUDA_ERROR_LAUNCH_FAILED));
    assert!(rig.driver.launches().is_empty());
    assert_eq!(rig.driver.context_depth(), 0);
    assert!(main.shares_buffer_with(&original));

    rig.driver.clear_faults();
    compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect("copy succeeds once the fault is cleared");
    assert!(!main.shares_buffer_with(&original));
    assert_eq!(rig.driver.launches().len(), 2);
    assert_eq!(rig.driver.context_depth(), 0);
}

#[test]
fn shared_main_without_pool_is_an_error() {
    let rig = rig();
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let original = frame(0x1000_0000, PixelFormat::Nv12, 320, 240);
    let mut main = original.clone();
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);

    let err = compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect_err("no pool");
    assert!(matches!(err, VeneerError::Pool(_)));
    assert!(rig.driver.launches().is_empty());
}

#[test]
fn frames_must_match_the_plan() {
    let rig = rig();
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let mut main = frame(0x1000_0000, PixelFormat::Yuv420p, 320, 240);
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);
    let err = compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect_err("format drift");
    assert!(matches!(err, VeneerError::InvalidPairing(_)));
    assert_eq!(rig.driver.context_depth(), 0);
}

#[test]
fn closed_session_refuses_to_launch() {
    let mut rig = rig();
    rig.session.close().expect("close");
    let compositor =
        PlaneCompositor::new(check_formats(PixelFormat::Nv12, PixelFormat::Nv12).expect("plan"));
    let mut main = frame(0x1000_0000, PixelFormat::Nv12, 320, 240);
    let overlay = frame(0x2000_0000, PixelFormat::Nv12, 32, 32);
    let err = compositor
        .composite(&rig.session, &mut main, &overlay, OverlayOffset::origin())
        .expect_err("closed");
    assert!(matches!(err, VeneerError::InvariantViolation(_)));
    assert!(rig.driver.launches().is_empty());
}
