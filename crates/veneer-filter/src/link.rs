//! Input links: the non-blocking frame sources the synchronizer pulls from.

use std::collections::VecDeque;
use std::sync::Arc;

use veneer_core::device::DeviceFramesContext;
use veneer_core::types::Rational;

/// Result of one non-blocking pull.
#[derive(Debug, PartialEq)]
pub enum LinkPoll<F> {
    Frame(F),
    /// Nothing queued yet; the stream is still open.
    Empty,
    /// The stream has ended; no frame will follow.
    Eof,
}

/// A frame source that never blocks.
pub trait InputLink<F> {
    fn consume(&mut self) -> LinkPoll<F>;
}

/// Static properties of a link, fixed at configuration.
#[derive(Clone, Debug)]
pub struct LinkInfo {
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    pub frames_ctx: Option<Arc<DeviceFramesContext>>,
}

impl LinkInfo {
    pub fn new(time_base: Rational, width: u32, height: u32) -> Self {
        Self {
            time_base,
            width,
            height,
            frames_ctx: None,
        }
    }

    pub fn with_frames_ctx(mut self, frames_ctx: Arc<DeviceFramesContext>) -> Self {
        self.frames_ctx = Some(frames_ctx);
        self
    }
}

/// FIFO link fed by the caller.
#[derive(Debug)]
pub struct FrameQueue<F> {
    frames: VecDeque<F>,
    closed: bool,
}

impl<F> Default for FrameQueue<F> {
    fn default() -> Self {
        Self {
            frames: VecDeque::new(),
            closed: false,
        }
    }
}

impl<F> FrameQueue<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame.  Frames pushed after [`close`](Self::close) are still
    /// delivered before the end of stream.
    pub fn push(&mut self, frame: F) {
        self.frames.push_back(frame);
    }

    /// Signal end of stream once the queued frames are drained.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn pop(&mut self) -> Option<F> {
        self.frames.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = F> + '_ {
        self.frames.drain(..)
    }
}

impl<F> InputLink<F> for FrameQueue<F> {
    fn consume(&mut self) -> LinkPoll<F> {
        match self.frames.pop_front() {
            Some(frame) => LinkPoll::Frame(frame),
            None if self.closed => LinkPoll::Eof,
            None => LinkPoll::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_before_reporting_eof() {
        let mut q = FrameQueue::new();
        assert!(!q.is_closed());
        q.push(1);
        assert_eq!(q.consume(), LinkPoll::Frame(1));
        assert_eq!(q.consume(), LinkPoll::Empty);
        q.push(2);
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.len(), 1);
        assert_eq!(q.consume(), LinkPoll::Frame(2));
        assert_eq!(q.consume(), LinkPoll::Eof);
        assert_eq!(q.consume(), LinkPoll::Eof);
    }
}
