//! Option surface of the overlay stage.
//!
//! ```json
//! {
//!   "x": "main_w - overlay_w - 10",
//!   "y": "10",
//!   "eval": "frame",
//!   "eof_action": "repeat",
//!   "shortest": false,
//!   "repeatlast": true
//! }
//! ```
//!
//! Every field is optional; missing fields take the defaults shown above
//! except `x`/`y`, which default to `"0"`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use veneer_core::error::{Result, VeneerError};
use veneer_core::types::Rational;

use crate::framesync::{EofAction, SyncOptions};

/// When the position expressions are evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Once, when the output is configured (and after each command).
    Init,
    /// Before every composited frame.
    #[default]
    Frame,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    /// Horizontal position expression.
    pub x: String,
    /// Vertical position expression.
    pub y: String,
    pub eval: EvalMode,
    pub eof_action: EofAction,
    /// End the output when the shortest input ends.
    pub shortest: bool,
    /// Keep blending the last overlay frame after the overlay ends.
    pub repeatlast: bool,
    /// Explicit event time base; derived from the inputs when absent.
    pub time_base: Option<Rational>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            x: "0".into(),
            y: "0".into(),
            eval: EvalMode::Frame,
            eof_action: EofAction::Repeat,
            shortest: false,
            repeatlast: true,
            time_base: None,
        }
    }
}

impl OverlayConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            VeneerError::Config(format!(
                "Failed to read overlay config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.x.trim().is_empty() {
            return Err(VeneerError::Config("x expression is empty".into()));
        }
        if self.y.trim().is_empty() {
            return Err(VeneerError::Config("y expression is empty".into()));
        }
        if let Some(tb) = self.time_base
            && !tb.is_valid()
        {
            return Err(VeneerError::InvalidTimeBase {
                num: tb.num,
                den: tb.den,
            });
        }
        Ok(())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            eof_action: self.eof_action,
            shortest: self.shortest,
            repeatlast: self.repeatlast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = OverlayConfig::from_json_str("{}").expect("defaults");
        assert_eq!(cfg, OverlayConfig::default());
        assert_eq!(cfg.eval, EvalMode::Frame);
        assert_eq!(cfg.sync_options(), SyncOptions::default());
    }

    #[test]
    fn parses_every_field() {
        let cfg = OverlayConfig::from_json_str(
            r#"{
                "x": "W - w - 10",
                "y": "10",
                "eval": "init",
                "eof_action": "endall",
                "shortest": true,
                "repeatlast": false,
                "time_base": { "num": 1, "den": 90000 }
            }"#,
        )
        .expect("valid config");
        assert_eq!(cfg.x, "W - w - 10");
        assert_eq!(cfg.eval, EvalMode::Init);
        assert_eq!(cfg.eof_action, EofAction::Endall);
        assert!(cfg.shortest && !cfg.repeatlast);
        assert_eq!(cfg.time_base, Some(Rational::new(1, 90_000)));
    }

    #[test]
    fn rejects_unknown_values() {
        let err = OverlayConfig::from_json_str(r#"{ "eof_action": "loop" }"#)
            .expect_err("unknown eof action");
        assert_eq!(err.error_code(), 206);

        assert!(OverlayConfig::from_json_str(r#"{ "alpha": "straight" }"#).is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let path = std::env::temp_dir().join(format!(
            "veneer_overlay_config_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "x": "W - w", "eval": "init" }"#).expect("write config");
        let cfg = OverlayConfig::from_json_file(&path).expect("valid file");
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.x, "W - w");
        assert_eq!(cfg.eval, EvalMode::Init);

        let err = OverlayConfig::from_json_file(&path).expect_err("file is gone");
        assert!(matches!(err, VeneerError::Config(_)));
        assert!(err.to_string().contains("veneer_overlay_config_"));
    }

    #[test]
    fn validation() {
        let err = OverlayConfig::from_json_str(r#"{ "x": "  " }"#).expect_err("empty x");
        assert!(matches!(err, VeneerError::Config(_)));

        let err = OverlayConfig::from_json_str(r#"{ "time_base": { "num": 1, "den": 0 } }"#)
            .expect_err("bad time base");
        assert!(matches!(err, VeneerError::InvalidTimeBase { .. }));
    }
}
