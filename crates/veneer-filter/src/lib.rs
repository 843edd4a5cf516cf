#![doc = include_str!("../README.md")]

pub mod config;
pub mod expr;
pub mod filter;
pub mod framesync;
pub mod link;
pub mod position;

pub use config::{EvalMode, OverlayConfig};
pub use expr::{CompiledExpr, Expression, ParseError, Variables, compile};
pub use filter::{OverlayBlend, OverlayCudaFilter};
pub use framesync::{
    Activation, DualInputSync, EofAction, EventHandler, SyncEvent, SyncOptions, Timed,
    merge_time_bases,
};
pub use link::{FrameQueue, InputLink, LinkInfo, LinkPoll};
pub use position::{Axis, FrameVars, PositionEvaluator};
