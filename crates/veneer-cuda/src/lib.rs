#![doc = include_str!("../README.md")]

pub mod dispatch;
pub mod kernels;
pub mod planes;
pub mod session;
pub mod sys;

pub use dispatch::{PlaneCompositor, make_writable};
pub use kernels::{KernelImage, OVERLAY_KERNEL, OverlayLaunch, launch_config_2d};
pub use planes::{OverlayOffset, PlanePlan, PlaneStep, XPosition, check_formats};
pub use session::{ContextGuard, DeviceSession};
pub use sys::DynamicDriver;
