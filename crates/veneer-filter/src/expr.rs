//! Arithmetic expressions for the overlay position.
//!
//! Expressions are compiled once into a small tree and evaluated against a
//! [`Variables`] vector as often as needed.  The grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary ('^' unary)?
//! primary := number | name | name '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Names are the position variables (`main_w`/`W`, `main_h`/`H`,
//! `overlay_w`/`w`, `overlay_h`/`h`, `x`, `y`, `n`, `t`, `pos`) and the
//! constants `PI`, `E`, `PHI`.
//!
//! The compiled tree is at most [`MAX_DEPTH`] levels deep; deeper input is
//! rejected with a [`ParseError`].

use std::fmt;

/// Nesting limit for parentheses, calls, unary signs and operator chains.
pub const MAX_DEPTH: usize = 100;

/// Values an expression may reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Variables {
    pub main_w: f64,
    pub main_h: f64,
    pub overlay_w: f64,
    pub overlay_h: f64,
    pub x: f64,
    pub y: f64,
    pub n: f64,
    pub t: f64,
    pub pos: f64,
}

impl Default for Variables {
    fn default() -> Self {
        Self {
            main_w: 0.0,
            main_h: 0.0,
            overlay_w: 0.0,
            overlay_h: 0.0,
            x: f64::NAN,
            y: f64::NAN,
            n: 0.0,
            t: f64::NAN,
            pos: f64::NAN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Var {
    MainW,
    MainH,
    OverlayW,
    OverlayH,
    X,
    Y,
    N,
    T,
    Pos,
}

impl Var {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "main_w" | "W" => Self::MainW,
            "main_h" | "H" => Self::MainH,
            "overlay_w" | "w" => Self::OverlayW,
            "overlay_h" | "h" => Self::OverlayH,
            "x" => Self::X,
            "y" => Self::Y,
            "n" => Self::N,
            "t" => Self::T,
            "pos" => Self::Pos,
            _ => return None,
        })
    }

    fn get(self, vars: &Variables) -> f64 {
        match self {
            Self::MainW => vars.main_w,
            Self::MainH => vars.main_h,
            Self::OverlayW => vars.overlay_w,
            Self::OverlayH => vars.overlay_h,
            Self::X => vars.x,
            Self::Y => vars.y,
            Self::N => vars.n,
            Self::T => vars.t,
            Self::Pos => vars.pos,
        }
    }
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "PI" => Some(std::f64::consts::PI),
        "E" => Some(std::f64::consts::E),
        "PHI" => Some(1.618_033_988_749_895),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Abs,
    Floor,
    Ceil,
    Trunc,
    Round,
    Sqrt,
    Mod,
    If,
    IfNot,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Clip,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "trunc" => Self::Trunc,
            "round" => Self::Round,
            "sqrt" => Self::Sqrt,
            "mod" => Self::Mod,
            "if" => Self::If,
            "ifnot" => Self::IfNot,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "eq" => Self::Eq,
            "clip" => Self::Clip,
            _ => return None,
        })
    }

    /// Accepted argument counts (inclusive).
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Abs | Self::Floor | Self::Ceil | Self::Trunc | Self::Round | Self::Sqrt => (1, 1),
            Self::Min
            | Self::Max
            | Self::Mod
            | Self::Lt
            | Self::Lte
            | Self::Gt
            | Self::Gte
            | Self::Eq => (2, 2),
            Self::If | Self::IfNot => (2, 3),
            Self::Clip => (3, 3),
        }
    }

    fn apply(self, a: &[f64]) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            Self::Min => a[0].min(a[1]),
            Self::Max => a[0].max(a[1]),
            Self::Abs => a[0].abs(),
            Self::Floor => a[0].floor(),
            Self::Ceil => a[0].ceil(),
            Self::Trunc => a[0].trunc(),
            Self::Round => a[0].round(),
            Self::Sqrt => a[0].sqrt(),
            Self::Mod => a[0] - a[1] * (a[0] / a[1]).floor(),
            Self::If => {
                if a[0] != 0.0 {
                    a[1]
                } else {
                    a.get(2).copied().unwrap_or(0.0)
                }
            }
            Self::IfNot => {
                if a[0] == 0.0 {
                    a[1]
                } else {
                    a.get(2).copied().unwrap_or(0.0)
                }
            }
            Self::Lt => flag(a[0] < a[1]),
            Self::Lte => flag(a[0] <= a[1]),
            Self::Gt => flag(a[0] > a[1]),
            Self::Gte => flag(a[0] >= a[1]),
            Self::Eq => flag(a[0] == a[1]),
            Self::Clip => {
                if a[1] > a[2] {
                    f64::NAN
                } else {
                    a[0].max(a[1]).min(a[2])
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Num(f64),
    Var(Var),
    Neg(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

impl Node {
    fn eval(&self, vars: &Variables) -> f64 {
        match self {
            Self::Num(v) => *v,
            Self::Var(var) => var.get(vars),
            Self::Neg(inner) => -inner.eval(vars),
            Self::Bin(op, l, r) => {
                let (l, r) = (l.eval(vars), r.eval(vars));
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Pow => l.powf(r),
                }
            }
            Self::Call(func, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(vars)).collect();
                func.apply(&values)
            }
        }
    }
}

// ─── Public surface ──────────────────────────────────────────────────────────

/// A compiled position expression.
pub trait Expression: fmt::Debug + Send {
    fn eval(&self, vars: &Variables) -> f64;
}

/// Parse failure with the byte offset it was detected at.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} at byte {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

/// Expression compiled by [`compile`].
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledExpr {
    root: Node,
}

impl Expression for CompiledExpr {
    fn eval(&self, vars: &Variables) -> f64 {
        self.root.eval(vars)
    }
}

/// Compile `text` with the built-in grammar.
pub fn compile(text: &str) -> Result<CompiledExpr, ParseError> {
    let mut parser = Parser {
        src: text,
        at: 0,
        depth: 0,
    };
    parser.skip_ws();
    if parser.at == text.len() {
        return Err(parser.error("empty expression"));
    }
    let root = parser.expr()?;
    parser.skip_ws();
    if parser.at != text.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(CompiledExpr { root })
}

/// [`compile`] boxed behind the [`Expression`] trait.
pub fn compile_boxed(text: &str) -> Result<Box<dyn Expression>, ParseError> {
    Ok(Box::new(compile(text)?))
}

// ─── Parser ──────────────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    at: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            offset: self.at,
            message: message.into(),
        }
    }

    /// Enter one level of nesting.  Errors abort the parse, so callers only
    /// [`ascend`](Self::ascend) on success.
    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.at).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.at += 1;
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.term()?;
        let mut links = 0;
        loop {
            let op = if self.eat(b'+') {
                BinOp::Add
            } else if self.eat(b'-') {
                BinOp::Sub
            } else {
                self.ascend(links);
                return Ok(lhs);
            };
            self.descend()?;
            links += 1;
            let rhs = self.term()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.unary()?;
        let mut links = 0;
        loop {
            let op = if self.eat(b'*') {
                BinOp::Mul
            } else if self.eat(b'/') {
                BinOp::Div
            } else {
                self.ascend(links);
                return Ok(lhs);
            };
            self.descend()?;
            links += 1;
            let rhs = self.unary()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Node, ParseError> {
        if self.eat(b'-') {
            self.descend()?;
            let inner = self.unary()?;
            self.ascend(1);
            return Ok(Node::Neg(Box::new(inner)));
        }
        if self.eat(b'+') {
            self.descend()?;
            let inner = self.unary()?;
            self.ascend(1);
            return Ok(inner);
        }
        self.power()
    }

    fn power(&mut self) -> Result<Node, ParseError> {
        let base = self.primary()?;
        if self.eat(b'^') {
            self.descend()?;
            let exp = self.unary()?;
            self.ascend(1);
            return Ok(Node::Bin(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of expression")),
            Some(b'(') => {
                self.at += 1;
                self.descend()?;
                let inner = self.expr()?;
                if !self.eat(b')') {
                    return Err(self.error("expected ')'"));
                }
                self.ascend(1);
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.name(),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c as char))),
        }
    }

    fn number(&mut self) -> Result<Node, ParseError> {
        let start = self.at;
        let bytes = self.src.as_bytes();
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.at += 1;
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut look = self.at + 1;
            if matches!(bytes.get(look), Some(b'+' | b'-')) {
                look += 1;
            }
            if bytes.get(look).is_some_and(|c| c.is_ascii_digit()) {
                self.at = look;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.at += 1;
                }
            }
        }
        let text = &self.src[start..self.at];
        text.parse::<f64>().map(Node::Num).map_err(|_| ParseError {
            offset: start,
            message: format!("invalid number '{text}'"),
        })
    }

    fn name(&mut self) -> Result<Node, ParseError> {
        let start = self.at;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.at += 1;
        }
        let name = &self.src[start..self.at];

        if self.eat(b'(') {
            let Some(func) = Func::lookup(name) else {
                return Err(ParseError {
                    offset: start,
                    message: format!("unknown function '{name}'"),
                });
            };
            self.descend()?;
            let mut args = vec![self.expr()?];
            while self.eat(b',') {
                args.push(self.expr()?);
            }
            if !self.eat(b')') {
                return Err(self.error("expected ')' or ','"));
            }
            self.ascend(1);
            let (lo, hi) = func.arity();
            if args.len() < lo || args.len() > hi {
                return Err(ParseError {
                    offset: start,
                    message: format!("'{name}' takes {lo}..={hi} arguments, got {}", args.len()),
                });
            }
            return Ok(Node::Call(func, args));
        }

        if let Some(var) = Var::lookup(name) {
            return Ok(Node::Var(var));
        }
        if let Some(value) = constant(name) {
            return Ok(Node::Num(value));
        }
        Err(ParseError {
            offset: start,
            message: format!("undefined constant or missing '(' in '{name}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, vars: &Variables) -> f64 {
        compile(text).expect("compiles").eval(vars)
    }

    fn frame_vars() -> Variables {
        Variables {
            main_w: 1920.0,
            main_h: 1080.0,
            overlay_w: 64.0,
            overlay_h: 32.0,
            x: 0.0,
            y: 0.0,
            n: 3.0,
            t: 0.12,
            pos: f64::NAN,
        }
    }

    #[test]
    fn precedence_and_associativity() {
        let v = Variables::default();
        assert_eq!(eval("1 + 2 * 3", &v), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &v), 9.0);
        assert_eq!(eval("10 - 4 - 3", &v), 3.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &v), 512.0);
        assert_eq!(eval("-2 ^ 2", &v), -4.0);
        assert_eq!(eval("8 / 2 / 2", &v), 2.0);
        assert_eq!(eval("1.5e2 + .5", &v), 150.5);
    }

    #[test]
    fn variables_and_aliases() {
        let v = frame_vars();
        assert_eq!(eval("main_w - overlay_w - 10", &v), 1846.0);
        assert_eq!(eval("W-w", &v), 1856.0);
        assert_eq!(eval("(H - h) / 2", &v), 524.0);
        assert_eq!(eval("n * 4", &v), 12.0);
        assert!(eval("pos", &v).is_nan());
    }

    #[test]
    fn functions() {
        let v = frame_vars();
        assert_eq!(eval("min(W, 100)", &v), 100.0);
        assert_eq!(eval("max(-1, abs(-7))", &v), 7.0);
        assert_eq!(eval("mod(n * 100, 250)", &v), 50.0);
        assert_eq!(eval("mod(-1, 4)", &v), 3.0);
        assert_eq!(eval("if(gt(n, 2), 10, 20)", &v), 10.0);
        assert_eq!(eval("if(lt(n, 2), 10)", &v), 0.0);
        assert_eq!(eval("ifnot(eq(n, 3), 1, 2)", &v), 2.0);
        assert_eq!(eval("clip(5000, 0, W - w)", &v), 1856.0);
        assert!(eval("clip(1, 5, 0)", &v).is_nan());
        assert_eq!(eval("trunc(-2.7) + floor(2.7) + ceil(2.2) + round(2.5)", &v), 6.0);
        assert!((eval("sqrt(2) * sqrt(2)", &v) - 2.0).abs() < 1e-12);
        assert!((eval("PI", &v) - std::f64::consts::PI).abs() < 1e-15);
    }

    #[test]
    fn nan_propagates() {
        let v = Variables::default();
        assert!(eval("x + 1", &v).is_nan());
        assert!(eval("t * 100", &v).is_nan());
    }

    #[test]
    fn errors_carry_offsets() {
        let err = compile("10 + foo").expect_err("unknown name");
        assert_eq!(err.offset, 5);
        assert!(err.message.contains("foo"));

        let err = compile("bogus(1)").expect_err("unknown function");
        assert_eq!(err.offset, 0);

        let err = compile("(1 + 2").expect_err("unbalanced");
        assert_eq!(err.offset, 6);

        let err = compile("1 2").expect_err("trailing");
        assert_eq!(err.offset, 2);

        assert!(compile("").is_err());
        assert!(compile("   ").is_err());
        assert!(compile("min(1)").is_err());
        assert!(compile("1 + $").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let n = 100_000;
        let parens = format!("{}1{}", "(".repeat(n), ")".repeat(n));
        let err = compile(&parens).expect_err("too many parentheses");
        assert_eq!(err.message, "expression nested too deeply");
        assert!(err.offset <= MAX_DEPTH + 1);

        let signs = format!("{}1", "-".repeat(n));
        assert!(compile(&signs).is_err());

        let calls = format!("{}1{}", "abs(".repeat(n), ")".repeat(n));
        assert!(compile(&calls).is_err());

        let chain = format!("1{}", "+1".repeat(n));
        assert!(compile(&chain).is_err());

        let powers = format!("2{}", "^1".repeat(n));
        assert!(compile(&powers).is_err());
    }

    #[test]
    fn nesting_within_the_limit_compiles() {
        let v = Variables::default();
        let depth = MAX_DEPTH / 2;
        let parens = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(eval(&parens, &v), 1.0);

        let chain = format!("1{}", " + 1".repeat(depth));
        assert_eq!(eval(&chain, &v), (depth + 1) as f64);

        // Each group releases its depth before the next one starts.
        let siblings = vec!["((1))"; 40].join(" * ");
        assert_eq!(eval(&siblings, &v), 1.0);
    }
}
