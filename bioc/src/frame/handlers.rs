use super::{Frame, FrameSink};
use crate::runtime::dispatch::{Poster, RawFrame, Request};
use crate::trace::{debug, warn};

type Handler = Box<dyn FnMut(Frame<'_>) + Send>;

/// Opcode-keyed handlers. Lookup is a linear scan in registration order and
/// every entry whose opcode matches is called; unmatched frames are ignored.
#[derive(Default)]
pub struct HandlerTable {
    entries: Vec<(u32, Handler)>,
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, opcode: u32, handler: F) -> &mut Self
    where
        F: FnMut(Frame<'_>) + Send + 'static,
    {
        self.entries.push((opcode, Box::new(handler)));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FrameSink for HandlerTable {
    fn on_frame(&mut self, frame: Frame<'_>) {
        let mut matched = false;
        for (_, handler) in self.entries.iter_mut().filter(|(op, _)| *op == frame.opcode) {
            handler(frame);
            matched = true;
        }
        if !matched {
            debug!("no handler for opcode {:#06x}", frame.opcode);
        }
    }
}

impl core::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(op, _)| format!("{op:#06x}")))
            .finish()
    }
}

/// Handler that copies each frame into a [`Request::RawFrame`] and posts it.
/// Drops are logged; the link keeps running.
pub fn forward_to(poster: Poster) -> impl FnMut(Frame<'_>) + Send + 'static {
    move |frame: Frame<'_>| {
        let Some(raw) = RawFrame::new(frame.opcode, frame.payload) else {
            warn!("frame {:#06x} too large to forward", frame.opcode);
            return;
        };
        if let Err(e) = poster.post(Request::RawFrame(raw), None) {
            debug!("frame {:#06x} not forwarded: {e}", frame.opcode);
        }
    }
}
