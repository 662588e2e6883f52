//! Framed byte-stream protocol shared by the serial and SPI links.
//!
//! A link owns one [`FrameContext`] and pushes whatever its reader returns
//! into [`FrameContext::feed`]; complete frames come out through a
//! [`FrameSink`], usually a [`HandlerTable`]. [`pack`] produces frames for
//! the opposite direction.
//!
//! ```
//! use bioc::frame::{self, Frame, FrameContext, FrameLayout, HandlerTable};
//!
//! let mut table = HandlerTable::new();
//! table.register(frame::opcode::STATE_REPORT, |f: Frame<'_>| {
//!     assert_eq!(f.payload, &[0, 1, 2, 3]);
//! });
//!
//! let bytes = frame::pack(&FrameLayout::UART, frame::opcode::STATE_REPORT, &[0, 1, 2, 3]).unwrap();
//! let mut ctx = FrameContext::uart();
//! assert_eq!(ctx.feed(&bytes, &mut table).frames, 1);
//! ```

mod codec;
mod crc;
mod handlers;
mod layout;
mod parser;

pub use codec::{pack, pack_into, PackError};
pub use crc::crc16_ibm;
pub use handlers::{forward_to, HandlerTable};
pub use layout::{ByteOrder, FieldWidth, FrameLayout, CRC_LEN};
pub use parser::{FeedReport, FrameContext, ParseState, Progress};

/// Well-known opcodes.
pub mod opcode {
    /// Motion controller state, serial link.
    pub const STATE_REPORT: u32 = 0x04A1;
    /// Motion controller configuration, serial link.
    pub const CONFIG_REPORT: u32 = 0x04A0;

    /// Sensor board message types, SPI link.
    pub mod spi {
        pub const CMD_REQ: u32 = 0x2000_0000;
        pub const CMD_BOOTING: u32 = 0x2000_0001;
        pub const CMD_ACK: u32 = 0x2000_0003;
        pub const CMD_SEND: u32 = 0x2000_1001;
        pub const HEART_BEAT: u32 = 0x2001_0000;
        pub const TEMPERATURE: u32 = 0x2002_0100;
        pub const QUERY_DATA: u32 = 0x2002_0200;
        pub const DEV_STATUS: u32 = 0x2002_0300;
    }
}

/// A validated frame, borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub opcode: u32,
    pub payload: &'a [u8],
}

/// Receiver of decoded frames.
pub trait FrameSink {
    fn on_frame(&mut self, frame: Frame<'_>);
}

impl<F> FrameSink for F
where
    F: FnMut(Frame<'_>),
{
    fn on_frame(&mut self, frame: Frame<'_>) {
        self(frame);
    }
}
