//! Pixel format contracts, time bases, and input roles.
//!
//! # Pixel formats
//!
//! Only two 4:2:0 families are compositable:
//!
//! ```text
//! Nv12      Y  (w × h)   UV interleaved (w bytes × h/2)
//! Yuv420p   Y  (w × h)   U (w/2 × h/2)   V (w/2 × h/2)
//! Yuva420p  Y  U  V  as above            A (w × h)
//! ```
//!
//! The remaining variants exist so hardware frames carrying other software
//! formats can be described and rejected at configuration time.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Software layout of a GPU-resident frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Luma plane + one interleaved Cb/Cr plane, 2×2 subsampled.
    Nv12,
    /// Luma plane + separate Cb and Cr planes, 2×2 subsampled.
    Yuv420p,
    /// `Yuv420p` with a full-resolution alpha plane as plane 3.
    Yuva420p,
    /// 10-bit `Nv12` variant (two bytes per sample).
    P010,
    /// Planar 4:4:4, no subsampling.
    Yuv444p,
    /// Packed 8-bit BGRA.
    Bgra,
}

/// Plane layout family of a compositable format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneFamily {
    /// Luma + interleaved chroma (two planes).
    ChromaPacked,
    /// Luma + two independent chroma planes, optional alpha.
    Planar,
}

impl PixelFormat {
    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nv12 => "nv12",
            Self::Yuv420p => "yuv420p",
            Self::Yuva420p => "yuva420p",
            Self::P010 => "p010",
            Self::Yuv444p => "yuv444p",
            Self::Bgra => "bgra",
        }
    }

    /// Family for the formats the overlay kernel can blend, `None` otherwise.
    pub const fn family(self) -> Option<PlaneFamily> {
        match self {
            Self::Nv12 => Some(PlaneFamily::ChromaPacked),
            Self::Yuv420p | Self::Yuva420p => Some(PlaneFamily::Planar),
            Self::P010 | Self::Yuv444p | Self::Bgra => None,
        }
    }

    /// Number of independently addressed planes.
    pub const fn plane_count(self) -> usize {
        match self {
            Self::Nv12 | Self::P010 => 2,
            Self::Yuv420p | Self::Yuv444p => 3,
            Self::Yuva420p => 4,
            Self::Bgra => 1,
        }
    }

    /// Whether an alpha plane accompanies the color planes.
    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::Yuva420p | Self::Bgra)
    }

    /// Index of the alpha plane, when present as a separate plane.
    pub const fn alpha_plane(self) -> Option<usize> {
        match self {
            Self::Yuva420p => Some(3),
            _ => None,
        }
    }

    /// Bytes per sample.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::P010 => 2,
            Self::Bgra => 4,
            _ => 1,
        }
    }

    /// `(log2_chroma_w, log2_chroma_h)` subsampling shifts.
    pub const fn chroma_shift(self) -> (u32, u32) {
        match self {
            Self::Nv12 | Self::P010 | Self::Yuv420p | Self::Yuva420p => (1, 1),
            Self::Yuv444p | Self::Bgra => (0, 0),
        }
    }

    /// `(row_bytes, rows)` of one plane for a `width × height` frame.
    ///
    /// Chroma dimensions round up, so odd frame sizes keep their last
    /// chroma column/row.
    pub fn plane_extent(self, plane: usize, width: u32, height: u32) -> (usize, usize) {
        let w = width as usize;
        let h = height as usize;
        let bps = self.bytes_per_sample();
        let (sx, sy) = self.chroma_shift();
        let sub = |v: usize, s: u32| (v + (1 << s) - 1) >> s;
        match (self, plane) {
            (Self::Bgra, _) => (w * bps, h),
            (_, 0) => (w * bps, h),
            // Interleaved Cb/Cr: two samples per subsampled column.
            (Self::Nv12 | Self::P010, 1) => (sub(w, sx) * 2 * bps, sub(h, sy)),
            (Self::Yuva420p, 3) => (w, h),
            (_, _) => (sub(w, sx) * bps, sub(h, sy)),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Input role ──────────────────────────────────────────────────────────────

/// Which of the two inputs a value belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputRole {
    Main,
    Overlay,
}

impl InputRole {
    pub const fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Overlay => 1,
        }
    }
}

impl fmt::Display for InputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Overlay => "overlay",
        })
    }
}

// ─── Time base ───────────────────────────────────────────────────────────────

/// Rational time base (`num / den` seconds per tick).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    /// Microsecond time base used as the fallback when merged bases overflow.
    pub const MICROS: Self = Self::new(1, 1_000_000);

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Both terms positive.
    pub const fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Floating-point value of one tick in seconds.
    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Convert `ts` ticks of `self` into seconds.
    pub fn seconds(self, ts: i64) -> f64 {
        ts as f64 * self.as_f64()
    }

    /// Rescale `ts` from `self` into `to`, rounding to nearest with ties
    /// away from zero.  `i64::MIN` and `i64::MAX` pass through unchanged so
    /// they keep working as open-ended sentinels.
    pub fn rescale(self, ts: i64, to: Self) -> i64 {
        if ts == i64::MIN || ts == i64::MAX || self == to {
            return ts;
        }
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        let half = den / 2;
        let q = if num >= 0 {
            (num + half) / den
        } else {
            (num - half) / den
        };
        q.clamp(i64::MIN as i128 + 1, i64::MAX as i128 - 1) as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
