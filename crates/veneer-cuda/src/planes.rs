//! Per-format plane plans.
//!
//! A [`PlanePlan`] is derived once from the `(main, overlay)` format pair at
//! output configuration and lists the kernel launches every composited
//! event issues, in order:
//!
//! | main      | overlay             | launches | chroma offset       | alpha align |
//! |-----------|---------------------|----------|---------------------|-------------|
//! | `Nv12`    | `Nv12`              | 2        | `(x, y/2)`          | none        |
//! | `Yuv420p` | `Yuv420p`           | 3        | `(x/2, y/2)`        | none        |
//! | `Yuv420p` | `Yuva420p`          | 3        | `(x/2, y/2)`        | (1,1) (2,2) |

use std::fmt;

use veneer_core::error::{Result, VeneerError};
use veneer_core::types::{InputRole, PixelFormat, PlaneFamily};

// ─── Offset ──────────────────────────────────────────────────────────────────

/// Horizontal overlay position after reduction.
///
/// An expression that evaluates to NaN leaves the position unset; the kernel
/// receives `i32::MAX` in that case, which places the overlay outside every
/// plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XPosition {
    /// Even pixel column.
    Aligned(i32),
    Unset,
}

impl XPosition {
    /// Value passed to the kernel for [`XPosition::Unset`].
    pub const UNSET_SENTINEL: i32 = i32::MAX;

    /// Truncate toward zero, then clear the low bit.
    pub fn from_f64(x: f64) -> Self {
        if x.is_nan() {
            Self::Unset
        } else {
            Self::Aligned((x as i32) & !1)
        }
    }

    pub fn kernel_value(self) -> i32 {
        match self {
            Self::Aligned(x) => x,
            Self::Unset => Self::UNSET_SENTINEL,
        }
    }
}

impl fmt::Display for XPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aligned(x) => write!(f, "{x}"),
            Self::Unset => f.write_str("unset"),
        }
    }
}

/// Integer overlay offset in luma pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlayOffset {
    pub x: XPosition,
    pub y: i32,
}

impl OverlayOffset {
    pub const fn new(x: XPosition, y: i32) -> Self {
        Self { x, y }
    }

    pub const fn origin() -> Self {
        Self::new(XPosition::Aligned(0), 0)
    }
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// One kernel launch of a composited event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneStep {
    /// Plane index, identical in main and overlay.
    pub plane: usize,
    /// `(log2 x, log2 y)` divisor applied to the luma offset.
    pub offset_shift: (u32, u32),
    /// `(log2 x, log2 y)` divisor applied to the overlay frame size.
    pub overlay_shift: (u32, u32),
    /// Overlay alpha plane bound to this launch, if any.
    pub alpha_plane: Option<usize>,
    /// `(align_x, align_y)` stepping through the alpha plane.
    pub alpha_align: (i32, i32),
}

impl PlaneStep {
    /// Offset of this plane for a luma offset.
    pub fn offset(&self, offset: OverlayOffset) -> (i32, i32) {
        (
            offset.x.kernel_value() / (1 << self.offset_shift.0),
            offset.y / (1 << self.offset_shift.1),
        )
    }

    /// Overlay extent on this plane for an overlay frame of `width × height`.
    pub fn overlay_extent(&self, width: u32, height: u32) -> (i32, i32) {
        (
            (width >> self.overlay_shift.0) as i32,
            (height >> self.overlay_shift.1) as i32,
        )
    }
}

/// Ordered launches for one `(main, overlay)` format pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanePlan {
    main: PixelFormat,
    overlay: PixelFormat,
    steps: Vec<PlaneStep>,
}

impl PlanePlan {
    /// Validate the format pair and derive its launches.
    ///
    /// # Errors
    ///
    /// - [`VeneerError::UnsupportedFormat`] if either format is outside the
    ///   input's whitelist.
    /// - [`VeneerError::IncompatibleFormats`] if both are individually
    ///   supported but cannot be blended together.
    pub fn for_formats(main: PixelFormat, overlay: PixelFormat) -> Result<Self> {
        if !matches!(main, PixelFormat::Nv12 | PixelFormat::Yuv420p) {
            return Err(VeneerError::UnsupportedFormat {
                input: InputRole::Main,
                format: main,
            });
        }
        let Some(overlay_family) = overlay.family() else {
            return Err(VeneerError::UnsupportedFormat {
                input: InputRole::Overlay,
                format: overlay,
            });
        };
        if main.family() != Some(overlay_family) {
            return Err(VeneerError::IncompatibleFormats { main, overlay });
        }

        let alpha = overlay.alpha_plane();
        let luma = PlaneStep {
            plane: 0,
            offset_shift: (0, 0),
            overlay_shift: (0, 0),
            alpha_plane: alpha,
            alpha_align: (1, 1),
        };

        let steps = match overlay_family {
            PlaneFamily::ChromaPacked => vec![
                luma,
                PlaneStep {
                    plane: 1,
                    offset_shift: (0, 1),
                    overlay_shift: (0, 1),
                    alpha_plane: None,
                    alpha_align: (0, 0),
                },
            ],
            PlaneFamily::Planar => {
                let chroma = |plane| PlaneStep {
                    plane,
                    offset_shift: (1, 1),
                    overlay_shift: (1, 1),
                    alpha_plane: alpha,
                    alpha_align: (2, 2),
                };
                vec![luma, chroma(1), chroma(2)]
            }
        };

        Ok(Self {
            main,
            overlay,
            steps,
        })
    }

    pub fn main_format(&self) -> PixelFormat {
        self.main
    }

    pub fn overlay_format(&self) -> PixelFormat {
        self.overlay
    }

    pub fn steps(&self) -> &[PlaneStep] {
        &self.steps
    }

    /// Kernel launches per composited event.
    pub fn launches(&self) -> usize {
        self.steps.len()
    }
}

/// Check a `(main, overlay)` format pair; see [`PlanePlan::for_formats`].
pub fn check_formats(main: PixelFormat, overlay: PixelFormat) -> Result<PlanePlan> {
    PlanePlan::for_formats(main, overlay)
}
