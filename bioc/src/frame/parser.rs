//! Streaming frame recovery.
//!
//! [`FrameContext`] buffers bytes from one link and extracts validated frames.
//! Corruption is handled by dropping a single byte and scanning again, so a
//! real frame hiding behind a false head is never skipped.

use super::crc::crc16_ibm;
use super::layout::{FrameLayout, CRC_LEN};
use super::{Frame, FrameSink};
use crate::config::ConfigError;
use crate::trace::{debug, trace};

/// Where the parser is within the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Looking for a head byte.
    Seeking,
    /// A head byte sits at offset 0; waiting for the rest of the frame or
    /// validating it.
    HaveHeader,
    /// A validated frame occupies the front of the buffer.
    Dispatching { opcode: u32, payload_len: usize },
}

/// Outcome of one [`FrameContext::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// State changed; step again.
    Continue,
    /// Nothing more can happen until more bytes arrive.
    NeedInput,
}

/// What one [`FrameContext::feed`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedReport {
    /// Frames handed to the sink.
    pub frames: usize,
    /// Bytes thrown away while resynchronizing.
    pub discarded: usize,
}

impl FeedReport {
    fn absorb(&mut self, other: Self) {
        self.frames += other.frames;
        self.discarded += other.discarded;
    }
}

pub struct FrameContext {
    layout: FrameLayout,
    buf: Box<[u8]>,
    len: usize,
    state: ParseState,
}

impl FrameContext {
    /// # Errors
    ///
    /// [`ConfigError`] if the largest frame of `layout` does not fit its
    /// buffer.
    pub fn new(layout: FrameLayout) -> Result<Self, ConfigError> {
        layout.validate()?;
        Ok(Self {
            layout,
            buf: vec![0u8; layout.capacity].into_boxed_slice(),
            len: 0,
            state: ParseState::Seeking,
        })
    }

    /// Context for the serial link.
    #[must_use]
    pub fn uart() -> Self {
        Self {
            layout: FrameLayout::UART,
            buf: vec![0u8; FrameLayout::UART.capacity].into_boxed_slice(),
            len: 0,
            state: ParseState::Seeking,
        }
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ParseState {
        self.state
    }

    /// Bytes held back waiting for the rest of a frame.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Drops everything buffered.
    pub fn reset(&mut self) {
        self.len = 0;
        self.state = ParseState::Seeking;
    }

    /// Accepts `bytes` and dispatches every frame they complete.
    ///
    /// Input is taken in buffer-sized pieces with parsing in between. Parsing
    /// only waits for input with room left in the buffer, so every byte is
    /// eventually either part of a frame or discarded.
    pub fn feed<S: FrameSink + ?Sized>(&mut self, mut bytes: &[u8], sink: &mut S) -> FeedReport {
        let mut report = FeedReport::default();
        loop {
            let take = bytes.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
            self.len += take;
            bytes = &bytes[take..];

            report.absorb(self.drain(sink));
            if bytes.is_empty() {
                return report;
            }
        }
    }

    fn drain<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> FeedReport {
        let mut report = FeedReport::default();
        while let Progress::Continue = self.step_inner(sink, &mut report) {}
        report
    }

    /// Advances the state machine by one transition.
    pub fn step<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Progress {
        let mut report = FeedReport::default();
        self.step_inner(sink, &mut report)
    }

    fn step_inner<S: FrameSink + ?Sized>(&mut self, sink: &mut S, report: &mut FeedReport) -> Progress {
        match self.state {
            ParseState::Seeking => self.seek(report),
            ParseState::HaveHeader => self.validate(report),
            ParseState::Dispatching {
                opcode,
                payload_len,
            } => {
                let start = self.layout.payload_offset();
                debug!("frame {opcode:#06x}, {payload_len} bytes");
                sink.on_frame(Frame {
                    opcode,
                    payload: &self.buf[start..start + payload_len],
                });
                self.consume(self.layout.overhead() + payload_len);
                report.frames += 1;
                self.state = ParseState::Seeking;
                Progress::Continue
            }
        }
    }

    fn seek(&mut self, report: &mut FeedReport) -> Progress {
        let min = self.layout.min_frame();
        if self.len < min {
            return Progress::NeedInput;
        }
        let head = self.layout.head;
        match self.buf[..=self.len - min].iter().position(|&b| b == head) {
            Some(at) => {
                if at > 0 {
                    trace!(skipped = at, "seek");
                    self.consume(at);
                    report.discarded += at;
                }
                self.state = ParseState::HaveHeader;
                Progress::Continue
            }
            None => {
                // The tail end may still hold the start of a head.
                let scanned = self.len - (min - 1);
                trace!(skipped = scanned, "no head");
                self.consume(scanned);
                report.discarded += scanned;
                Progress::NeedInput
            }
        }
    }

    fn validate(&mut self, report: &mut FeedReport) -> Progress {
        let layout = self.layout;
        let declared = layout.read_field(layout.length, &self.buf[layout.length_offset()..]);
        let payload_len = match usize::try_from(declared) {
            Ok(n) if n <= layout.max_payload => n,
            _ => return self.resync(report, "length"),
        };

        let total = layout.overhead() + payload_len;
        if self.len < total {
            if self.len == self.buf.len() {
                return self.resync(report, "stall");
            }
            return Progress::NeedInput;
        }

        if self.buf[total - 1] != layout.tail {
            return self.resync(report, "tail");
        }

        let body = layout.payload_offset() + payload_len;
        let expected = u16::from_be_bytes([self.buf[body], self.buf[body + 1]]);
        debug_assert_eq!(body + CRC_LEN, total - 1);
        if crc16_ibm(&self.buf[..body]) != expected {
            return self.resync(report, "crc");
        }

        let opcode = layout.read_field(layout.opcode, &self.buf[layout.opcode_offset()..]) as u32;
        self.state = ParseState::Dispatching {
            opcode,
            payload_len,
        };
        Progress::Continue
    }

    fn resync(&mut self, report: &mut FeedReport, reason: &'static str) -> Progress {
        trace!(reason, "resync");
        self.consume(1);
        report.discarded += 1;
        self.state = ParseState::Seeking;
        Progress::Continue
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl core::fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameContext")
            .field("state", &self.state)
            .field("buffered", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}
