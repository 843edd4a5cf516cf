//! Dual-input frame synchronizer.
//!
//! Reconciles two independently paced inputs ("main" and "overlay") into a
//! sequence of aligned events.  Each input owns a slot holding its current
//! frame and one frame of lookahead; an event fires at the smallest
//! lookahead timestamp once the main input has a frame for it.
//!
//! # Extension modes
//!
//! Outside the range an input covers, its slot behaves according to its
//! `before` / `after` mode:
//!
//! | mode       | effect                                               |
//! |------------|------------------------------------------------------|
//! | `Stop`     | hold the output (before) or end everything (after)   |
//! | `Null`     | the input contributes no frame                       |
//! | `Infinity` | the first/last frame extends without bound           |
//!
//! Defaults: main `Stop`/`Infinity` with sync level 2, overlay
//! `Null`/`Infinity` with sync level 1.  Only inputs at the current sync
//! level trigger events, so with both inputs running the main input paces
//! the output.
//!
//! # State machine per input
//!
//! ```text
//! AwaitingFirst ──first frame──▶ Running ──end of stream──▶ Exhausted
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use veneer_core::error::{Result, VeneerError};
use veneer_core::frame::GpuFrame;
use veneer_core::types::{InputRole, Rational};

use crate::link::{InputLink, LinkPoll};

/// Merged denominators at or above this fall back to microseconds.
const TIME_BASE_LCM_LIMIT: i64 = 500_000;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Behavior of an input outside the range it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtMode {
    Stop,
    Null,
    Infinity,
}

/// Lifecycle of one input slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    AwaitingFirst,
    Running,
    Exhausted,
}

/// What happens when the overlay input ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofAction {
    /// Keep blending the last overlay frame.
    #[default]
    Repeat,
    /// End the output.
    Endall,
    /// Forward main frames unmodified.
    Pass,
}

/// End-of-stream policy of the synchronizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    pub eof_action: EofAction,
    pub shortest: bool,
    pub repeatlast: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            eof_action: EofAction::Repeat,
            shortest: false,
            repeatlast: true,
        }
    }
}

impl SyncOptions {
    /// Resolve the interactions between the three options.
    ///
    /// `repeatlast = false` and `pass` imply each other; `shortest` and
    /// `endall` imply each other, and win over `pass`.
    pub fn normalized(mut self) -> Self {
        if !self.repeatlast || self.eof_action == EofAction::Pass {
            self.repeatlast = false;
            self.eof_action = EofAction::Pass;
        }
        if self.shortest || self.eof_action == EofAction::Endall {
            self.shortest = true;
            self.eof_action = EofAction::Endall;
        }
        self
    }
}

// ─── Contracts ───────────────────────────────────────────────────────────────

/// Frames carrying a presentation timestamp.
pub trait Timed {
    fn pts(&self) -> Option<i64>;
    /// Re-stamp the frame; `None` clears the timestamp.
    fn set_pts(&mut self, pts: Option<i64>);
}

impl Timed for GpuFrame {
    fn pts(&self) -> Option<i64> {
        self.pts
    }

    fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }
}

/// One aligned frame pair.
#[derive(Debug)]
pub struct SyncEvent<'a, F> {
    /// Main frame, re-stamped with `pts` (left unstamped when `pts` is
    /// `i64::MIN`).  Owned by the handler.
    pub main: F,
    /// Overlay frame covering `pts`, if any.
    pub overlay: Option<&'a F>,
    /// Event timestamp in `time_base`.
    pub pts: i64,
    pub time_base: Rational,
    /// 0-based event counter.
    pub index: u64,
}

impl<F> SyncEvent<'_, F> {
    /// Event timestamp in seconds.
    pub fn seconds(&self) -> Option<f64> {
        (self.pts != i64::MIN).then(|| self.time_base.seconds(self.pts))
    }
}

/// Receives every event the synchronizer fires.
pub trait EventHandler<F> {
    fn on_event(&mut self, event: SyncEvent<'_, F>) -> Result<()>;
}

/// Outcome of one [`DualInputSync::activate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// An event was delivered to the handler.
    Event,
    /// At least one input has nothing queued yet.
    NeedInput,
    /// The output has ended; further calls keep returning `Eof`.
    Eof,
}

// ─── Slots ───────────────────────────────────────────────────────────────────

const MAIN: usize = 0;
const OVERLAY: usize = 1;

#[derive(Debug)]
struct Slot<F> {
    frame: Option<F>,
    frame_next: Option<F>,
    pts: i64,
    pts_next: i64,
    have_next: bool,
    before: ExtMode,
    after: ExtMode,
    sync: u32,
    state: SlotState,
    time_base: Rational,
}

impl<F> Slot<F> {
    fn new(before: ExtMode, after: ExtMode, sync: u32) -> Self {
        Self {
            frame: None,
            frame_next: None,
            pts: i64::MIN,
            pts_next: i64::MIN,
            have_next: false,
            before,
            after,
            sync,
            state: SlotState::AwaitingFirst,
            time_base: Rational::MICROS,
        }
    }

    fn main() -> Self {
        Self::new(ExtMode::Stop, ExtMode::Infinity, 2)
    }

    fn overlay() -> Self {
        Self::new(ExtMode::Null, ExtMode::Infinity, 1)
    }
}

// ─── Synchronizer ────────────────────────────────────────────────────────────

/// Two-input synchronizer with its event handler.
pub struct DualInputSync<F, H> {
    slots: [Slot<F>; 2],
    handler: H,
    options: SyncOptions,
    time_base: Option<Rational>,
    pts: i64,
    sync_level: u32,
    eof: bool,
    frame_ready: bool,
    events: u64,
}

impl<F, H> DualInputSync<F, H>
where
    F: Timed + Clone,
    H: EventHandler<F>,
{
    /// Unconfigured synchronizer with the dual-input defaults.
    pub fn new(handler: H) -> Self {
        Self {
            slots: [Slot::main(), Slot::overlay()],
            handler,
            options: SyncOptions::default(),
            time_base: None,
            pts: i64::MIN,
            sync_level: u32::MAX,
            eof: false,
            frame_ready: false,
            events: 0,
        }
    }

    /// Apply the end-of-stream policy and fix the shared time base.
    ///
    /// Without an explicit `time_base`, the bases of the inputs that take
    /// part in synchronization are merged (see [`merge_time_bases`]).
    /// Returns the time base events are stamped in.
    pub fn configure(
        &mut self,
        options: SyncOptions,
        main_tb: Rational,
        overlay_tb: Rational,
        time_base: Option<Rational>,
    ) -> Result<Rational> {
        for tb in [Some(main_tb), Some(overlay_tb), time_base].into_iter().flatten() {
            if !tb.is_valid() {
                return Err(VeneerError::InvalidTimeBase {
                    num: tb.num,
                    den: tb.den,
                });
            }
        }

        let options = options.normalized();
        let mut slots = [Slot::main(), Slot::overlay()];
        slots[MAIN].time_base = main_tb;
        slots[OVERLAY].time_base = overlay_tb;
        if !options.repeatlast {
            slots[OVERLAY].after = ExtMode::Null;
            slots[OVERLAY].sync = 0;
        }
        if options.shortest {
            for slot in &mut slots {
                slot.after = ExtMode::Stop;
            }
        }

        let time_base = match time_base {
            Some(tb) => tb,
            None => merge_time_bases(
                slots
                    .iter()
                    .filter(|s| s.sync > 0)
                    .map(|s| s.time_base),
            )
            .ok_or_else(|| VeneerError::Config("impossible to set time base".into()))?,
        };

        self.slots = slots;
        self.options = options;
        self.time_base = Some(time_base);
        self.pts = i64::MIN;
        self.sync_level = u32::MAX;
        self.eof = false;
        self.frame_ready = false;
        self.events = 0;
        self.update_sync_level();

        info!(
            %time_base,
            eof_action = ?options.eof_action,
            shortest = options.shortest,
            repeatlast = options.repeatlast,
            sync_level = self.sync_level,
            "Frame sync configured"
        );
        Ok(time_base)
    }

    /// Pull what is available, and deliver at most one event.
    ///
    /// Never blocks.  A handler error is returned unchanged; its event is
    /// consumed and not delivered again.
    pub fn activate(
        &mut self,
        main: &mut dyn InputLink<F>,
        overlay: &mut dyn InputLink<F>,
    ) -> Result<Activation> {
        let Some(time_base) = self.time_base else {
            return Err(VeneerError::InvariantViolation(
                "frame sync activated before configure()".into(),
            ));
        };

        self.frame_ready = false;
        self.advance([main, overlay]);
        if self.eof {
            return Ok(Activation::Eof);
        }
        if !self.frame_ready {
            return Ok(Activation::NeedInput);
        }
        self.fire(time_base)?;
        Ok(Activation::Event)
    }

    fn advance(&mut self, mut links: [&mut dyn InputLink<F>; 2]) {
        while !(self.frame_ready || self.eof) {
            if !self.consume(&mut links) {
                return;
            }

            let pts = self
                .slots
                .iter()
                .filter(|s| s.have_next)
                .map(|s| s.pts_next)
                .min()
                .unwrap_or(i64::MAX);
            if pts == i64::MAX {
                self.set_eof();
                break;
            }

            for i in 0..self.slots.len() {
                let slot = &mut self.slots[i];
                let promote = slot.pts_next == pts
                    || (slot.before == ExtMode::Infinity && slot.state == SlotState::AwaitingFirst);
                if !promote {
                    continue;
                }
                slot.frame = slot.frame_next.take();
                slot.pts = slot.pts_next;
                slot.pts_next = i64::MIN;
                slot.have_next = false;
                slot.state = if slot.frame.is_some() {
                    SlotState::Running
                } else {
                    SlotState::Exhausted
                };
                let triggers = slot.sync == self.sync_level && slot.frame.is_some();
                let ends = slot.state == SlotState::Exhausted && slot.after == ExtMode::Stop;
                if triggers {
                    self.frame_ready = true;
                }
                if ends {
                    self.set_eof();
                }
            }

            if self.frame_ready
                && self
                    .slots
                    .iter()
                    .any(|s| s.state == SlotState::AwaitingFirst && s.before == ExtMode::Stop)
            {
                self.frame_ready = false;
            }
            self.pts = pts;
        }
    }

    /// Fill every open slot's lookahead.  Returns `false` when an input has
    /// nothing queued.
    fn consume(&mut self, links: &mut [&mut dyn InputLink<F>; 2]) -> bool {
        let mut missing = false;
        for (index, link) in links.iter_mut().enumerate() {
            let slot = &self.slots[index];
            if slot.have_next || slot.state == SlotState::Exhausted {
                continue;
            }
            match link.consume() {
                LinkPoll::Frame(frame) => self.inject_frame(index, frame),
                LinkPoll::Eof => self.inject_eof(index),
                LinkPoll::Empty => missing = true,
            }
        }
        !missing
    }

    fn inject_frame(&mut self, index: usize, mut frame: F) {
        let to = self.time_base.unwrap_or(Rational::MICROS);
        let slot = &mut self.slots[index];
        let pts = match frame.pts() {
            Some(pts) => {
                let pts = slot.time_base.rescale(pts, to);
                frame.set_pts(Some(pts));
                pts
            }
            None => i64::MIN,
        };
        trace!(input = %role(index), pts, "Frame queued for sync");
        slot.frame_next = Some(frame);
        slot.pts_next = pts;
        slot.have_next = true;
    }

    fn inject_eof(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let pts = if slot.state != SlotState::Running || slot.after == ExtMode::Infinity {
            i64::MAX
        } else {
            slot.pts.saturating_add(1)
        };
        slot.sync = 0;
        debug!(input = %role(index), end_pts = pts, "Input reached end of stream");
        self.update_sync_level();

        let slot = &mut self.slots[index];
        slot.frame_next = None;
        slot.pts_next = pts;
        slot.have_next = true;
    }

    fn update_sync_level(&mut self) {
        let level = self
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Exhausted)
            .map(|s| s.sync)
            .max()
            .unwrap_or(0);
        if level == 0 {
            self.set_eof();
            return;
        }
        if level < self.sync_level && self.sync_level != u32::MAX {
            debug!(sync_level = level, "Sync level lowered");
        }
        self.sync_level = level;
    }

    fn set_eof(&mut self) {
        if !self.eof {
            debug!(pts = self.pts, "Frame sync reached end of output");
        }
        self.eof = true;
        self.frame_ready = false;
    }

    /// Hand the current pair to the handler.
    fn fire(&mut self, time_base: Rational) -> Result<()> {
        let main_pts_next = {
            let main = &self.slots[MAIN];
            if main.have_next { main.pts_next } else { i64::MAX }
        };
        let other = &self.slots[OVERLAY];
        let need_copy = other.sync != 0 && (!other.have_next || other.pts_next < main_pts_next);

        let main_slot = &mut self.slots[MAIN];
        let main = if need_copy {
            main_slot.frame.clone()
        } else {
            main_slot.frame.take()
        };
        self.frame_ready = false;

        let Some(mut main) = main else {
            return Err(VeneerError::InvalidPairing(format!(
                "no main frame for event at pts {}",
                self.pts
            )));
        };
        // Timestamp-less events keep the frame timestamp-less.
        main.set_pts((self.pts != i64::MIN).then_some(self.pts));

        let index = self.events;
        self.events += 1;
        let event = SyncEvent {
            main,
            overlay: self.slots[OVERLAY].frame.as_ref(),
            pts: self.pts,
            time_base,
            index,
        };
        self.handler.on_event(event)
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Shared time base, once configured.
    pub fn time_base(&self) -> Option<Rational> {
        self.time_base
    }

    /// Options after normalization.
    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn is_configured(&self) -> bool {
        self.time_base.is_some()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Timestamp of the last event (or of the last advance step).
    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn sync_level(&self) -> u32 {
        self.sync_level
    }

    pub fn events_delivered(&self) -> u64 {
        self.events
    }

    pub fn slot_state(&self, input: InputRole) -> SlotState {
        self.slots[input.index()].state
    }

    /// `(before, after)` modes of an input.
    pub fn ext_modes(&self, input: InputRole) -> (ExtMode, ExtMode) {
        let slot = &self.slots[input.index()];
        (slot.before, slot.after)
    }

    pub fn sync_of(&self, input: InputRole) -> u32 {
        self.slots[input.index()].sync
    }

    /// Whether the input's slot still holds a current frame.
    pub fn holds_frame(&self, input: InputRole) -> bool {
        self.slots[input.index()].frame.is_some()
    }
}

impl<F, H> std::fmt::Debug for DualInputSync<F, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualInputSync")
            .field("time_base", &self.time_base)
            .field("options", &self.options)
            .field("pts", &self.pts)
            .field("sync_level", &self.sync_level)
            .field("eof", &self.eof)
            .field("events", &self.events)
            .finish()
    }
}

fn role(index: usize) -> InputRole {
    if index == MAIN {
        InputRole::Main
    } else {
        InputRole::Overlay
    }
}

/// Merge time bases: identical bases are kept, otherwise denominators are
/// combined by LCM (numerators by GCD) while the LCM stays below 500 000,
/// falling back to 1/1 000 000.  `None` for an empty input.
pub fn merge_time_bases(bases: impl IntoIterator<Item = Rational>) -> Option<Rational> {
    let mut merged: Option<Rational> = None;
    for tb in bases {
        merged = Some(match merged {
            None => tb,
            Some(cur) if cur == tb => cur,
            Some(cur) => {
                let g = gcd(cur.den, tb.den);
                match (cur.den / g).checked_mul(tb.den) {
                    Some(lcm) if lcm < TIME_BASE_LCM_LIMIT => {
                        Rational::new(gcd(cur.num, tb.num), lcm)
                    }
                    _ => return Some(Rational::MICROS),
                }
            }
        });
    }
    merged
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}
