//! Wire geometry of a framed link.
//!
//! ```text
//! HEAD | OPCODE | LENGTH | PAYLOAD[LENGTH] | CRC16 (BE) | TAIL
//! ```
//!
//! The CRC covers `HEAD..=PAYLOAD` and is always big-endian; opcode and length
//! width and byte order vary per link.

use crate::config::ConfigError;

/// Bytes of the trailing CRC.
pub const CRC_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Width of a numeric header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldWidth {
    Two = 2,
    Four = 4,
}

impl FieldWidth {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::Two => u16::MAX as u64,
            Self::Four => u32::MAX as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub head: u8,
    pub tail: u8,
    pub opcode: FieldWidth,
    pub length: FieldWidth,
    pub order: ByteOrder,
    /// Largest accepted `LENGTH`.
    pub max_payload: usize,
    /// Receive buffer size of a [`FrameContext`](super::FrameContext).
    pub capacity: usize,
}

impl FrameLayout {
    /// Serial link to the motion controller.
    pub const UART: Self = Self {
        head: 0x64,
        tail: 0xEE,
        opcode: FieldWidth::Two,
        length: FieldWidth::Two,
        order: ByteOrder::Big,
        max_payload: 64,
        capacity: 256,
    };

    /// SPI link to the sensor board: wide little-endian header fields.
    pub const SPI: Self = Self {
        head: 0x5A,
        tail: 0xA5,
        opcode: FieldWidth::Four,
        length: FieldWidth::Four,
        order: ByteOrder::Little,
        max_payload: 128,
        capacity: 256,
    };

    /// Bytes a frame occupies besides its payload.
    #[inline]
    #[must_use]
    pub const fn overhead(&self) -> usize {
        1 + self.opcode.bytes() + self.length.bytes() + CRC_LEN + 1
    }

    /// Size of an empty frame; the parser never looks for a head closer than
    /// this to the end of the buffer.
    #[inline]
    #[must_use]
    pub const fn min_frame(&self) -> usize {
        self.overhead()
    }

    #[inline]
    #[must_use]
    pub const fn max_frame(&self) -> usize {
        self.overhead() + self.max_payload
    }

    #[inline]
    pub(crate) const fn opcode_offset(&self) -> usize {
        1
    }

    #[inline]
    pub(crate) const fn length_offset(&self) -> usize {
        1 + self.opcode.bytes()
    }

    #[inline]
    pub(crate) const fn payload_offset(&self) -> usize {
        self.length_offset() + self.length.bytes()
    }

    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// A layout is usable when the largest frame fits the receive buffer and
    /// the largest payload fits the length field.
    ///
    /// # Errors
    ///
    /// [`ConfigError::TooLarge`] for the field that does not fit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload as u64 > self.length.max_value() {
            return Err(ConfigError::TooLarge {
                field: "max_payload",
                value: self.max_payload,
                limit: usize::try_from(self.length.max_value()).unwrap_or(usize::MAX),
            });
        }
        if self.max_frame() > self.capacity {
            return Err(ConfigError::TooLarge {
                field: "max_payload",
                value: self.max_frame(),
                limit: self.capacity,
            });
        }
        Ok(())
    }

    pub(crate) fn read_field(&self, width: FieldWidth, bytes: &[u8]) -> u64 {
        let bytes = &bytes[..width.bytes()];
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self.order {
            ByteOrder::Big => bytes.iter().fold(0, fold),
            ByteOrder::Little => bytes.iter().rev().fold(0, fold),
        }
    }

    pub(crate) fn write_field(&self, width: FieldWidth, value: u64, out: &mut [u8]) {
        let n = width.bytes();
        for (i, slot) in out[..n].iter_mut().enumerate() {
            let shift = match self.order {
                ByteOrder::Big => 8 * (n - 1 - i),
                ByteOrder::Little => 8 * i,
            };
            *slot = (value >> shift) as u8;
        }
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::UART
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_geometry() {
        assert_eq!(FrameLayout::UART.min_frame(), 8);
        assert_eq!(FrameLayout::UART.max_frame(), 72);
        assert_eq!(FrameLayout::SPI.min_frame(), 12);
        assert_eq!(FrameLayout::SPI.payload_offset(), 9);
        assert!(FrameLayout::UART.validate().is_ok());
        assert!(FrameLayout::SPI.validate().is_ok());
    }

    #[test]
    fn oversized_frames_do_not_validate() {
        let layout = FrameLayout::UART.with_max_payload(250);
        assert_eq!(
            layout.validate(),
            Err(ConfigError::TooLarge {
                field: "max_payload",
                value: 258,
                limit: 256
            })
        );
        assert!(FrameLayout::UART.with_max_payload(70_000).with_capacity(80_000).validate().is_err());
    }

    #[test]
    fn fields_honour_byte_order() {
        let mut buf = [0u8; 4];
        FrameLayout::UART.write_field(FieldWidth::Two, 0x04A1, &mut buf);
        assert_eq!(&buf[..2], &[0x04, 0xA1]);
        assert_eq!(FrameLayout::UART.read_field(FieldWidth::Two, &buf), 0x04A1);

        FrameLayout::SPI.write_field(FieldWidth::Four, 0x2001_0000, &mut buf);
        assert_eq!(buf, [0x00, 0x00, 0x01, 0x20]);
        assert_eq!(FrameLayout::SPI.read_field(FieldWidth::Four, &buf), 0x2001_0000);
    }
}
