//! Overlay blend kernel: embedded CUDA C source, NVRTC compilation, and the
//! launch parameter block.
//!
//! # Kernel compilation
//!
//! The source is compiled to PTX **once** per process via NVRTC and cached.
//! Every [`crate::session::DeviceSession`] loads its own module from the
//! cached image; hosts that ship a prebuilt PTX or cubin can skip NVRTC
//! entirely with [`KernelImage::from_ptx`] / [`KernelImage::from_binary`].
//!
//! # Parameter block
//!
//! ```text
//! Overlay_Cuda(x, y,
//!              main_ptr,    main_stride,
//!              overlay_ptr, overlay_stride, overlay_w, overlay_h,
//!              alpha_ptr,   alpha_stride,   align_x,   align_y)
//! ```
//!
//! `alpha_ptr == 0 && alpha_stride == 0` means "opaque overlay".

use std::sync::{Arc, OnceLock};

use tracing::info;

use veneer_core::driver::{KernelArg, LaunchDims};
use veneer_core::error::Result;
use veneer_core::ffi_types::CUdeviceptr;

/// Entry point resolved from the loaded module.
pub const OVERLAY_KERNEL: &str = "Overlay_Cuda";

/// Threads per block along x.
pub const BLOCK_X: u32 = 32;
/// Threads per block along y.
pub const BLOCK_Y: u32 = 16;

// ─── CUDA C kernel source ────────────────────────────────────────────────────

/// One thread per main-plane byte.  Threads outside the overlay rectangle
/// return immediately; inside it the overlay sample replaces the main sample,
/// weighted by the alpha plane when one is bound.
const OVERLAY_CUDA_SRC: &str = r#"
extern "C" __global__ void Overlay_Cuda(
    int x_position, int y_position,
    unsigned char*       __restrict__ main, int main_linesize,
    const unsigned char* __restrict__ overlay, int overlay_linesize,
    int overlay_w, int overlay_h,
    const unsigned char* __restrict__ overlay_alpha, int alpha_linesize,
    int alpha_adj_x, int alpha_adj_y)
{
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;

    long long ox = (long long)x - x_position;
    long long oy = (long long)y - y_position;
    if (ox < 0 || oy < 0 || ox >= overlay_w || oy >= overlay_h) return;

    unsigned char* dst = main + (long long)y * main_linesize + x;
    float src = (float)overlay[oy * overlay_linesize + ox];

    if (overlay_alpha == 0 || alpha_linesize == 0) {
        *dst = (unsigned char)src;
        return;
    }

    float a = overlay_alpha[alpha_adj_y * oy * alpha_linesize + alpha_adj_x * ox] / 255.0f;
    *dst = (unsigned char)(a * src + (1.0f - a) * (float)(*dst) + 0.5f);
}
"#;

// ─── Kernel image ────────────────────────────────────────────────────────────

/// Module image handed to `cuModuleLoadData`, always NUL-terminated.
#[derive(Clone, Debug)]
pub struct KernelImage {
    bytes: Arc<[u8]>,
}

static OVERLAY_IMAGE: OnceLock<KernelImage> = OnceLock::new();

impl KernelImage {
    /// PTX assembly text.
    pub fn from_ptx(ptx: &str) -> Self {
        let mut bytes = Vec::with_capacity(ptx.len() + 1);
        bytes.extend_from_slice(ptx.as_bytes());
        bytes.push(0);
        Self {
            bytes: bytes.into(),
        }
    }

    /// Prebuilt cubin or fatbin.
    pub fn from_binary(mut bytes: Vec<u8>) -> Self {
        if bytes.last() != Some(&0) {
            bytes.push(0);
        }
        Self {
            bytes: bytes.into(),
        }
    }

    /// The embedded overlay kernel, compiled on first use.
    ///
    /// # Errors
    ///
    /// Returns [`veneer_core::VeneerError::NvrtcCompile`] when NVRTC is
    /// unavailable or rejects the source.
    pub fn overlay() -> Result<Self> {
        if let Some(image) = OVERLAY_IMAGE.get() {
            return Ok(image.clone());
        }
        let ptx = cudarc::nvrtc::compile_ptx_with_opts(
            OVERLAY_CUDA_SRC,
            cudarc::nvrtc::CompileOptions {
                ftz: Some(true),
                prec_div: Some(false),
                prec_sqrt: Some(false),
                ..Default::default()
            },
        )?;
        let image = Self::from_ptx(&ptx.to_src());
        info!(
            kernel = OVERLAY_KERNEL,
            image_bytes = image.len(),
            "NVRTC: compiled overlay kernel"
        );
        Ok(OVERLAY_IMAGE.get_or_init(|| image).clone())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 1
    }
}

// ─── Launch parameters ───────────────────────────────────────────────────────

/// Argument block of one `Overlay_Cuda` launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayLaunch {
    pub x: i32,
    pub y: i32,
    pub main_ptr: CUdeviceptr,
    pub main_stride: i32,
    pub overlay_ptr: CUdeviceptr,
    pub overlay_stride: i32,
    pub overlay_w: i32,
    pub overlay_h: i32,
    pub alpha_ptr: CUdeviceptr,
    pub alpha_stride: i32,
    pub align_x: i32,
    pub align_y: i32,
}

impl OverlayLaunch {
    /// Arguments in kernel declaration order.
    pub fn to_args(&self) -> [KernelArg; 12] {
        [
            KernelArg::I32(self.x),
            KernelArg::I32(self.y),
            KernelArg::Ptr(self.main_ptr),
            KernelArg::I32(self.main_stride),
            KernelArg::Ptr(self.overlay_ptr),
            KernelArg::I32(self.overlay_stride),
            KernelArg::I32(self.overlay_w),
            KernelArg::I32(self.overlay_h),
            KernelArg::Ptr(self.alpha_ptr),
            KernelArg::I32(self.alpha_stride),
            KernelArg::I32(self.align_x),
            KernelArg::I32(self.align_y),
        ]
    }

    /// Rebuild a parameter block from recorded launch arguments.
    pub fn decode(args: &[KernelArg]) -> Option<Self> {
        use KernelArg::{I32, Ptr};
        match *args {
            [
                I32(x),
                I32(y),
                Ptr(main_ptr),
                I32(main_stride),
                Ptr(overlay_ptr),
                I32(overlay_stride),
                I32(overlay_w),
                I32(overlay_h),
                Ptr(alpha_ptr),
                I32(alpha_stride),
                I32(align_x),
                I32(align_y),
            ] => Some(Self {
                x,
                y,
                main_ptr,
                main_stride,
                overlay_ptr,
                overlay_stride,
                overlay_w,
                overlay_h,
                alpha_ptr,
                alpha_stride,
                align_x,
                align_y,
            }),
            _ => None,
        }
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha_ptr != 0 && self.alpha_stride != 0
    }
}

/// 2D launch config over a `width × height` byte region: 32×16 blocks.
pub fn launch_config_2d(width: usize, height: usize) -> LaunchDims {
    let block = (BLOCK_X, BLOCK_Y, 1u32);
    let grid = (
        (width as u32).div_ceil(block.0),
        (height as u32).div_ceil(block.1),
        1u32,
    );
    LaunchDims {
        grid,
        block,
        shared_mem_bytes: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_rounds_up_to_whole_tiles() {
        let dims = launch_config_2d(1920, 1080);
        assert_eq!(dims.grid, (60, 68, 1));
        assert_eq!(dims.block, (32, 16, 1));
        assert_eq!(dims.shared_mem_bytes, 0);

        let dims = launch_config_2d(33, 17);
        assert_eq!(dims.grid, (2, 2, 1));
    }

    #[test]
    fn argument_order_matches_kernel_signature() {
        let launch = OverlayLaunch {
            x: 10,
            y: 5,
            main_ptr: 0x1000,
            main_stride: 2048,
            overlay_ptr: 0x2000,
            overlay_stride: 64,
            overlay_w: 64,
            overlay_h: 32,
            alpha_ptr: 0,
            alpha_stride: 0,
            align_x: 0,
            align_y: 0,
        };
        let args = launch.to_args();
        assert_eq!(args[0], KernelArg::I32(10));
        assert_eq!(args[2], KernelArg::Ptr(0x1000));
        assert_eq!(args[8], KernelArg::Ptr(0));
        assert_eq!(OverlayLaunch::decode(&args), Some(launch));
        assert!(!launch.has_alpha());
        assert_eq!(OverlayLaunch::decode(&args[..11]), None);
    }

    #[test]
    fn images_are_nul_terminated() {
        let ptx = KernelImage::from_ptx(".version 7.0");
        assert_eq!(ptx.as_bytes().last(), Some(&0));
        assert_eq!(ptx.len(), ".version 7.0".len() + 1);

        let bin = KernelImage::from_binary(vec![0x7f, b'E', b'L', b'F']);
        assert_eq!(bin.len(), 5);
        let already = KernelImage::from_binary(vec![1, 2, 0]);
        assert_eq!(already.len(), 3);
        assert!(KernelImage::from_ptx("").is_empty());
    }

    #[test]
    fn embedded_source_declares_entry_point() {
        assert!(OVERLAY_CUDA_SRC.contains("extern \"C\" __global__ void Overlay_Cuda("));
    }
}
