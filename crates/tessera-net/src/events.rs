//! Packing application events into frames and unpacking them again.
//!
//! Inside a frame payload each event starts with a `bool` multi-packet flag
//! and a `u16` length:
//!
//! ```text
//! single: [0][len: u16][event bytes ...........]
//! multi:  [1][total: u16][first bytes ...]  | continuation bytes in the
//!                                           | following frames, no header
//! ```
//!
//! An event is written single when it fits in the space left in the current
//! frame; otherwise it is written multi-packet starting in the current frame
//! (or a fresh one if the 3-byte header would not fit) and spills forward
//! until `total` bytes have been emitted.

use std::collections::VecDeque;

use crate::codec::CodecError;
use crate::message::{MessagePool, NetworkMessage, PooledMessage};

/// `bool` flag + `u16` length.
pub const EVENT_HEADER_SIZE: usize = 3;

/// Initial capacity of the reassembly buffer.
const SCRATCH_CAPACITY: usize = 32 * 1024;

/// Errors raised while packing or unpacking events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event does not fit in the `u16` total-size field.
    #[error("event of {0} bytes exceeds the maximum event size {max}", max = u16::MAX)]
    EventTooLarge(usize),

    /// The frame payload does not follow the event layout.
    #[error("malformed event stream: {0}")]
    Malformed(#[from] CodecError),
}

/// Receives complete events in arrival order.
pub trait EventHandler {
    fn process_event(&mut self, event: &[u8]);
}

impl<F> EventHandler for F
where
    F: FnMut(&[u8]),
{
    fn process_event(&mut self, event: &[u8]) {
        self(event)
    }
}

/// Packs events into pooled frames.
///
/// Completed frames collect in an internal queue that the owner drains with
/// [`EventWriter::take_finished`].
pub struct EventWriter {
    pool: MessagePool,
    current: Option<PooledMessage>,
    finished: VecDeque<PooledMessage>,
}

impl EventWriter {
    pub fn new(pool: MessagePool) -> Self {
        Self {
            pool,
            current: None,
            finished: VecDeque::new(),
        }
    }

    fn current_message(&mut self) -> &mut PooledMessage {
        self.current.get_or_insert_with(|| self.pool.get())
    }

    fn finish_current(&mut self) {
        if let Some(message) = self.current.take() {
            if message.is_empty() {
                return;
            }
            self.finished.push_back(message);
        }
    }

    /// Append one event, splitting it across frames when necessary.
    pub fn add_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        let total = u16::try_from(event.len()).map_err(|_| EventError::EventTooLarge(event.len()))?;

        let message = self.current_message();
        if event.len() + EVENT_HEADER_SIZE <= message.empty_space() {
            message.write_bool(false);
            message.write_u16(total);
            message.write_raw(event);
            return Ok(());
        }

        if message.empty_space() < EVENT_HEADER_SIZE {
            self.finish_current();
        }

        let message = self.current_message();
        message.write_bool(true);
        message.write_u16(total);

        let mut rest = event;
        loop {
            let written = self.current_message().write_partial(rest);
            rest = &rest[written..];
            if rest.is_empty() {
                break;
            }
            self.finish_current();
        }

        Ok(())
    }

    /// Close the frame being filled, if it holds anything.
    pub fn flush(&mut self) {
        self.finish_current();
    }

    /// Frames completed since the last call, oldest first.
    pub fn take_finished(&mut self) -> impl Iterator<Item = PooledMessage> + '_ {
        self.finished.drain(..)
    }

    pub fn has_finished(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Drop every pending frame, including the one being filled.
    pub fn discard(&mut self) {
        self.current = None;
        self.finished.clear();
    }
}

/// Reassembles events from consecutive frames.
pub struct EventReader {
    scratch: Vec<u8>,
    expected: usize,
    in_progress: bool,
}

impl EventReader {
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
            expected: 0,
            in_progress: false,
        }
    }

    /// True while a multi-packet event is waiting for continuation frames.
    pub fn is_reassembling(&self) -> bool {
        self.in_progress
    }

    /// Dispatch every event completed by `message`. Returns how many were
    /// dispatched.
    pub fn read_frame(
        &mut self,
        message: &mut NetworkMessage,
        handler: &mut dyn EventHandler,
    ) -> Result<usize, EventError> {
        if message.is_empty() {
            tracing::debug!("skipping zero-length frame");
            return Ok(0);
        }

        let result = self.read_events(message, handler);
        if result.is_err() {
            self.in_progress = false;
            self.scratch.clear();
        }
        result
    }

    fn read_events(
        &mut self,
        message: &mut NetworkMessage,
        handler: &mut dyn EventHandler,
    ) -> Result<usize, EventError> {
        let mut dispatched = 0;

        while message.remaining() > 0 {
            if self.in_progress {
                let needed = self.expected - self.scratch.len();
                let take = needed.min(message.remaining());
                self.scratch.extend_from_slice(message.read_raw(take)?);
                if self.scratch.len() == self.expected {
                    self.in_progress = false;
                    handler.process_event(&self.scratch);
                    dispatched += 1;
                }
                continue;
            }

            let multi = message.read_bool()?;
            let len = message.read_u16()? as usize;
            if multi {
                self.scratch.clear();
                self.scratch.reserve(len);
                self.expected = len;
                self.in_progress = len > 0;
                if len == 0 {
                    handler.process_event(&[]);
                    dispatched += 1;
                }
            } else {
                handler.process_event(message.read_raw(len)?);
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }
}

impl Default for EventReader {
    fn default() -> Self {
        Self::new()
    }
}
