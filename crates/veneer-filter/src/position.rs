//! Overlay position: two expressions reduced to a plane-aligned offset.
//!
//! # Evaluation order
//!
//! `x` may reference `y` and vice versa, so every evaluation runs three
//! steps against the shared variable vector:
//!
//! ```text
//! x ← eval(x_expr)      using the previous x and y
//! y ← eval(y_expr)      using the new x
//! x ← eval(x_expr)      using the new y
//! ```
//!
//! The stored pair is then reduced: `x` is truncated and its low bit
//! cleared (NaN leaves it [`XPosition::Unset`]), `y` is truncated.

use tracing::debug;

use veneer_core::error::{Result, VeneerError};
use veneer_cuda::planes::{OverlayOffset, XPosition};

use crate::expr::{Expression, Variables, compile_boxed};

/// Which expression a command or update targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub const fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            _ => None,
        }
    }
}

/// Per-event inputs refreshed before a frame-mode evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameVars {
    pub main_w: u32,
    pub main_h: u32,
    pub overlay_w: u32,
    pub overlay_h: u32,
    /// 0-based event counter.
    pub n: u64,
    /// Main timestamp in seconds.
    pub t: Option<f64>,
    /// Main byte position.
    pub pos: Option<i64>,
}

struct Compiled {
    text: String,
    expr: Box<dyn Expression>,
}

impl Compiled {
    fn new(axis: Axis, text: &str) -> Result<Self> {
        let expr = compile_boxed(text).map_err(|err| VeneerError::Expression {
            option: axis.name(),
            expr: text.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }
}

/// Holds the compiled `x`/`y` expressions, their variables, and the last
/// reduced offset.
pub struct PositionEvaluator {
    x: Compiled,
    y: Compiled,
    vars: Variables,
    offset: OverlayOffset,
}

impl PositionEvaluator {
    /// Compile both expressions.  The offset starts at the origin until the
    /// first [`evaluate`](Self::evaluate).
    pub fn new(x: &str, y: &str) -> Result<Self> {
        Ok(Self {
            x: Compiled::new(Axis::X, x)?,
            y: Compiled::new(Axis::Y, y)?,
            vars: Variables::default(),
            offset: OverlayOffset::origin(),
        })
    }

    /// Replace one expression.  On a parse error the previous expression is
    /// kept and the error returned.
    pub fn set_expression(&mut self, axis: Axis, text: &str) -> Result<()> {
        let compiled = Compiled::new(axis, text)?;
        match axis {
            Axis::X => self.x = compiled,
            Axis::Y => self.y = compiled,
        }
        Ok(())
    }

    pub fn expression(&self, axis: Axis) -> &str {
        match axis {
            Axis::X => &self.x.text,
            Axis::Y => &self.y.text,
        }
    }

    pub fn variables(&self) -> &Variables {
        &self.vars
    }

    /// Set the frame dimensions only, as done once at configuration.
    pub fn set_dimensions(&mut self, main_w: u32, main_h: u32, overlay_w: u32, overlay_h: u32) {
        self.vars.main_w = main_w as f64;
        self.vars.main_h = main_h as f64;
        self.vars.overlay_w = overlay_w as f64;
        self.vars.overlay_h = overlay_h as f64;
    }

    /// Refresh every per-event variable.
    pub fn refresh(&mut self, frame: &FrameVars) {
        self.set_dimensions(frame.main_w, frame.main_h, frame.overlay_w, frame.overlay_h);
        self.vars.n = frame.n as f64;
        self.vars.t = frame.t.unwrap_or(f64::NAN);
        self.vars.pos = frame.pos.map_or(f64::NAN, |p| p as f64);
    }

    /// Run the three-step evaluation and reduce the result.
    pub fn evaluate(&mut self) -> OverlayOffset {
        self.vars.x = self.x.expr.eval(&self.vars);
        self.vars.y = self.y.expr.eval(&self.vars);
        self.vars.x = self.x.expr.eval(&self.vars);

        // `as` saturates and maps NaN to 0.
        self.offset = OverlayOffset::new(XPosition::from_f64(self.vars.x), self.vars.y as i32);
        self.offset
    }

    /// [`refresh`](Self::refresh) + [`evaluate`](Self::evaluate), logged.
    pub fn evaluate_frame(&mut self, frame: &FrameVars) -> OverlayOffset {
        self.refresh(frame);
        let offset = self.evaluate();
        debug!(
            n = self.vars.n,
            t = self.vars.t,
            pos = self.vars.pos,
            x = self.vars.x,
            xi = %offset.x,
            y = self.vars.y,
            yi = offset.y,
            "Overlay position evaluated"
        );
        offset
    }

    /// Offset from the most recent evaluation.
    pub fn offset(&self) -> OverlayOffset {
        self.offset
    }
}

impl std::fmt::Debug for PositionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionEvaluator")
            .field("x", &self.x.text)
            .field("y", &self.y.text)
            .field("vars", &self.vars)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> FrameVars {
        FrameVars {
            main_w: 1280,
            main_h: 720,
            overlay_w: 100,
            overlay_h: 50,
            n,
            t: Some(n as f64 / 25.0),
            pos: None,
        }
    }

    #[test]
    fn odd_x_is_aligned_down_and_y_is_kept() {
        let mut pos = PositionEvaluator::new("101", "101").expect("compiles");
        let offset = pos.evaluate_frame(&frame(0));
        assert_eq!(offset, OverlayOffset::new(XPosition::Aligned(100), 101));
    }

    #[test]
    fn x_sees_y_from_the_same_evaluation() {
        let mut pos = PositionEvaluator::new("y * 2", "20").expect("compiles");
        let offset = pos.evaluate_frame(&frame(0));
        assert_eq!(offset.x, XPosition::Aligned(40));
        assert_eq!(offset.y, 20);
    }

    #[test]
    fn y_sees_x_from_step_one() {
        let mut pos = PositionEvaluator::new("W - w", "x / 4").expect("compiles");
        let offset = pos.evaluate_frame(&frame(0));
        assert_eq!(offset.x, XPosition::Aligned(1180));
        assert_eq!(offset.y, 295);
    }

    #[test]
    fn nan_x_is_unset_and_nan_y_is_zero() {
        let mut pos = PositionEvaluator::new("t", "pos").expect("compiles");
        let mut f = frame(0);
        f.t = None;
        let offset = pos.evaluate_frame(&f);
        assert_eq!(offset.x, XPosition::Unset);
        assert_eq!(offset.y, 0);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let mut pos = PositionEvaluator::new("mod(x + 7, 50)", "y").expect("compiles");
        pos.set_dimensions(1280, 720, 100, 50);
        let first = pos.evaluate();
        let vars = *pos.variables();
        let second = pos.evaluate();
        assert_eq!(first, second);
        assert!(vars.x.is_nan());
        assert_eq!(pos.offset(), second);

        let mut pos = PositionEvaluator::new("n * 10", "H / 2").expect("compiles");
        let a = pos.evaluate_frame(&frame(3));
        let b = pos.evaluate_frame(&frame(3));
        assert_eq!(a, b);
        assert_eq!(a, OverlayOffset::new(XPosition::Aligned(30), 360));
    }

    #[test]
    fn variables_start_unset() {
        let pos = PositionEvaluator::new("0", "0").expect("compiles");
        let vars = pos.variables();
        assert!(vars.x.is_nan() && vars.y.is_nan() && vars.t.is_nan() && vars.pos.is_nan());
        assert_eq!(vars.n, 0.0);
    }

    #[test]
    fn bad_expression_keeps_the_previous_one() {
        let mut pos = PositionEvaluator::new("10", "10").expect("compiles");
        let err = pos
            .set_expression(Axis::X, "10 +")
            .expect_err("incomplete expression");
        assert!(matches!(err, VeneerError::Expression { option: "x", .. }));
        assert_eq!(err.error_code(), 300);
        assert_eq!(pos.expression(Axis::X), "10");
        assert_eq!(pos.evaluate().x, XPosition::Aligned(10));

        pos.set_expression(Axis::Y, "H - h").expect("valid");
        assert_eq!(pos.expression(Axis::Y), "H - h");
    }

    #[test]
    fn construction_rejects_bad_expressions() {
        let err = PositionEvaluator::new("0", "main_q").expect_err("unknown name");
        assert!(err.to_string().contains("main_q"));
    }
}
