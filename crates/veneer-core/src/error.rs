//! Typed error hierarchy for the overlay stage.
//!
//! Uses `thiserror` for library-grade errors.  Every variant maps to a
//! stable integer code via [`VeneerError::error_code`] so the scheduler can
//! report failures without string parsing.

use crate::ffi_types::CUresult;
use crate::types::{InputRole, PixelFormat};

/// All errors originating from the overlay stage.
#[derive(Debug, thiserror::Error)]
pub enum VeneerError {
    // ── CUDA ──────────────────────────────────────────────────────────
    #[error("{call} failed -> {name}: {description} (CUresult {code})")]
    Driver {
        call: &'static str,
        code: CUresult,
        name: String,
        description: String,
    },

    #[error("CUDA driver API unavailable: {0}")]
    DriverUnavailable(String),

    #[error("CUDA kernel compilation error: {0}")]
    NvrtcCompile(#[from] cudarc::nvrtc::CompileError),

    // ── Configuration ─────────────────────────────────────────────────
    #[error("Missing hardware frames context on the {0} input")]
    MissingFramesContext(InputRole),

    #[error("Unsupported {input} input format {format}")]
    UnsupportedFormat {
        input: InputRole,
        format: PixelFormat,
    },

    #[error("Can't overlay {overlay} on {main}")]
    IncompatibleFormats {
        main: PixelFormat,
        overlay: PixelFormat,
    },

    #[error("Kernel module error: {0}")]
    KernelModule(String),

    #[error("Invalid time base {num}/{den}")]
    InvalidTimeBase { num: i64, den: i64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid configuration JSON: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("Output not configured: call configure_output() first")]
    NotConfigured,

    // ── Expressions ───────────────────────────────────────────────────
    #[error("Error when evaluating the expression '{expr}' for {option}: {reason}")]
    Expression {
        option: &'static str,
        expr: String,
        reason: String,
    },

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    // ── Synchronization ───────────────────────────────────────────────
    #[error("Invalid frame pairing: {0}")]
    InvalidPairing(String),

    #[error("Frame pool error: {0}")]
    Pool(String),

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl VeneerError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: CUDA/driver
    /// - 2xx: Configuration
    /// - 3xx: Expressions
    /// - 4xx: Synchronization / frame pairing
    /// - 5xx: Invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Driver { .. } => 100,
            Self::DriverUnavailable(_) => 101,
            Self::NvrtcCompile(_) => 102,
            Self::MissingFramesContext(_) => 200,
            Self::UnsupportedFormat { .. } => 201,
            Self::IncompatibleFormats { .. } => 202,
            Self::KernelModule(_) => 203,
            Self::InvalidTimeBase { .. } => 204,
            Self::Config(_) => 205,
            Self::ConfigJson(_) => 206,
            Self::NotConfigured => 207,
            Self::Expression { .. } => 300,
            Self::UnknownCommand(_) => 301,
            Self::InvalidPairing(_) => 400,
            Self::Pool(_) => 401,
            Self::InvariantViolation(_) => 500,
        }
    }

    /// Whether the error was raised while configuring the stage, before
    /// steady-state frame processing.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NvrtcCompile(_)
                | Self::MissingFramesContext(_)
                | Self::UnsupportedFormat { .. }
                | Self::IncompatibleFormats { .. }
                | Self::KernelModule(_)
                | Self::InvalidTimeBase { .. }
                | Self::Config(_)
                | Self::ConfigJson(_)
        )
    }

    /// Driver result code, if this error came from a driver call.
    pub fn cu_result(&self) -> Option<CUresult> {
        match self {
            Self::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VeneerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_message_carries_symbolic_name() {
        let err = VeneerError::Driver {
            call: "cuLaunchKernel",
            code: 719,
            name: "CUDA_ERROR_LAUNCH_FAILED".into(),
            description: "unspecified launch failure".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cuLaunchKernel"));
        assert!(msg.contains("CUDA_ERROR_LAUNCH_FAILED"));
        assert!(msg.contains("unspecified launch failure"));
        assert_eq!(err.cu_result(), Some(719));
        assert_eq!(err.error_code(), 100);
    }

    #[test]
    fn pairing_errors_are_not_configuration_errors() {
        let err = VeneerError::IncompatibleFormats {
            main: PixelFormat::Yuv420p,
            overlay: PixelFormat::Nv12,
        };
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Can't overlay nv12 on yuv420p");

        let err = VeneerError::InvalidPairing("main frame missing".into());
        assert!(!err.is_configuration());
        assert_eq!(err.error_code(), 400);
    }
}
