//! GPU-resident frame model.
//!
//! # Ownership model
//!
//! [`GpuFrame`] wraps its planes via `Arc<DeviceBuffer>`:
//!
//! - **Cheap clone**: cloning a frame increments a reference count; no
//!   device memory is copied.  The synchronizer relies on this when the
//!   same main picture has to be handed out for more than one event.
//! - **Copy-on-write**: a frame may only be written when it holds the sole
//!   reference to its buffer ([`GpuFrame::is_writable`]).  Otherwise the
//!   writer acquires a fresh buffer from the frames context's pool, copies
//!   the planes device-to-device, and swaps it in
//!   ([`GpuFrame::replace_buffer`]).
//! - **RAII**: a buffer may carry an opaque pool lease that returns the
//!   memory to its pool when the last reference drops.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::device::DeviceFramesContext;
use crate::error::Result;
use crate::ffi_types::CUdeviceptr;
use crate::types::PixelFormat;

/// One pitched plane in device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePlane {
    /// Device address of the first row.
    pub ptr: CUdeviceptr,
    /// Row stride in bytes.
    pub pitch: usize,
    /// Meaningful bytes per row (≤ `pitch`).
    pub row_bytes: usize,
    /// Number of rows.
    pub rows: usize,
}

/// Device allocation backing one frame.
pub struct DeviceBuffer {
    planes: Vec<DevicePlane>,
    _lease: Option<Box<dyn Any + Send + Sync>>,
}

impl DeviceBuffer {
    /// Wrap planes owned elsewhere (upstream decoder, test fixture).
    pub fn new(planes: Vec<DevicePlane>) -> Self {
        Self {
            planes,
            _lease: None,
        }
    }

    /// Wrap planes together with a lease that is dropped with the buffer.
    pub fn with_lease<L: Any + Send + Sync>(planes: Vec<DevicePlane>, lease: L) -> Self {
        Self {
            planes,
            _lease: Some(Box::new(lease)),
        }
    }

    /// Pitched planes sized for `format` at `width × height`, packed back
    /// to back starting at `base`.  Every plane uses a pitch of at least
    /// its row width rounded up to `align`.
    pub fn contiguous(
        base: CUdeviceptr,
        format: PixelFormat,
        width: u32,
        height: u32,
        align: usize,
    ) -> Self {
        let align = align.max(1);
        let mut next = base;
        let planes = (0..format.plane_count())
            .map(|i| {
                let (row_bytes, rows) = format.plane_extent(i, width, height);
                let pitch = row_bytes.div_ceil(align) * align;
                let plane = DevicePlane {
                    ptr: next,
                    pitch,
                    row_bytes,
                    rows,
                };
                next += (pitch * rows) as CUdeviceptr;
                plane
            })
            .collect();
        Self::new(planes)
    }

    pub fn planes(&self) -> &[DevicePlane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&DevicePlane> {
        self.planes.get(index)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("planes", &self.planes)
            .field("leased", &self._lease.is_some())
            .finish()
    }
}

/// Source of fresh frame buffers for one frames context.
pub trait FramePool: Send + Sync {
    /// Hand out an unshared buffer laid out for the pool's format and size.
    fn acquire(&self) -> Result<DeviceBuffer>;
}

/// A single video frame residing in GPU memory.
#[derive(Clone)]
pub struct GpuFrame {
    buffer: Arc<DeviceBuffer>,
    /// Software layout of the planes.
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in the producing link's time base.
    pub pts: Option<i64>,
    /// Byte offset of the originating packet in its stream.
    pub pos: Option<i64>,
    /// Hardware frames context the buffer was allocated from.
    pub frames_ctx: Option<Arc<DeviceFramesContext>>,
}

impl GpuFrame {
    pub fn new(buffer: DeviceBuffer, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            buffer: Arc::new(buffer),
            format,
            width,
            height,
            pts: None,
            pos: None,
            frames_ctx: None,
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_frames_ctx(mut self, frames_ctx: Arc<DeviceFramesContext>) -> Self {
        self.frames_ctx = Some(frames_ctx);
        self
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn plane(&self, index: usize) -> Option<&DevicePlane> {
        self.buffer.plane(index)
    }

    /// Whether this frame is the only holder of its buffer.
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.buffer) == 1 && Arc::weak_count(&self.buffer) == 0
    }

    /// Whether two frames share the same device buffer.
    pub fn shares_buffer_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Swap in a new, unshared buffer (after its planes were filled).
    pub fn replace_buffer(&mut self, buffer: DeviceBuffer) {
        self.buffer = Arc::new(buffer);
    }
}

impl fmt::Debug for GpuFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuFrame")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("pos", &self.pos)
            .field("planes", &self.buffer.planes())
            .finish()
    }
}
