#![doc = include_str!("../README.md")]

pub mod device;
pub mod driver;
pub mod error;
pub mod ffi_types;
pub mod frame;
pub mod mock;
pub mod types;

pub use device::{CudaDeviceContext, DeviceFramesContext};
pub use driver::{CudaDriver, KernelArg, LaunchDims, check_cu};
pub use error::{Result, VeneerError};
pub use frame::{DeviceBuffer, DevicePlane, FramePool, GpuFrame};
pub use types::{InputRole, PixelFormat, PlaneFamily, Rational};
