//! Typed requests accepted by the dispatcher.

use core::fmt;

/// Discriminant of a [`Request`]; keys the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    GotIp = 0,
    Peripheral,
    Wake,
    UartPayload,
    Temperature,
    RawFrame,
    LanNotify,
}

impl RequestKind {
    pub const COUNT: usize = 7;

    pub const ALL: [Self; Self::COUNT] = [
        Self::GotIp,
        Self::Peripheral,
        Self::Wake,
        Self::UartPayload,
        Self::Temperature,
        Self::RawFrame,
        Self::LanNotify,
    ];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Which physical input produced a peripheral event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralSource {
    Key,
    Knob,
    Lcd,
}

/// What a peripheral event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralTopic {
    Time,
    Net,
    Temperature,
    Booting,
    Knob,
}

/// Words of event data carried by a peripheral event.
pub const PERIPHERAL_DATA_WORDS: usize = 128;

#[derive(Clone, PartialEq, Eq)]
pub struct PeripheralEvent {
    pub source: PeripheralSource,
    pub topic: PeripheralTopic,
    pub data: [i32; PERIPHERAL_DATA_WORDS],
}

impl PeripheralEvent {
    #[must_use]
    pub const fn new(source: PeripheralSource, topic: PeripheralTopic) -> Self {
        Self {
            source,
            topic,
            data: [0; PERIPHERAL_DATA_WORDS],
        }
    }

    /// Copies up to [`PERIPHERAL_DATA_WORDS`] words into the event.
    #[must_use]
    pub fn with_data(mut self, words: &[i32]) -> Self {
        let n = words.len().min(PERIPHERAL_DATA_WORDS);
        self.data[..n].copy_from_slice(&words[..n]);
        self
    }
}

impl fmt::Debug for PeripheralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralEvent")
            .field("source", &self.source)
            .field("topic", &self.topic)
            .field("data[0]", &self.data[0])
            .finish_non_exhaustive()
    }
}

/// Motion controller state reported over the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UartPayload {
    pub run: i32,
    pub clamp: i32,
    pub cycle_count: i32,
}

/// Six thermocouple channels, degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TemperatureReading(pub [f64; 6]);

impl TemperatureReading {
    /// Bytes of the wire form: six little-endian `f64`s.
    pub const ENCODED_LEN: usize = 48;

    /// Decodes the leading [`ENCODED_LEN`](Self::ENCODED_LEN) bytes; `None`
    /// if fewer are given.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::ENCODED_LEN)?;
        let mut channels = [0.0; 6];
        for (value, chunk) in channels.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *value = f64::from_le_bytes(raw);
        }
        Some(Self(channels))
    }
}

/// Largest frame payload a [`RawFrame`] can carry.
pub const RAW_FRAME_CAPACITY: usize = 128;

/// A decoded wire frame handed over verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    opcode: u32,
    len: u8,
    bytes: [u8; RAW_FRAME_CAPACITY],
}

impl RawFrame {
    /// Copies a frame payload; `None` if it exceeds [`RAW_FRAME_CAPACITY`].
    #[must_use]
    pub fn new(opcode: u32, payload: &[u8]) -> Option<Self> {
        let len = u8::try_from(payload.len()).ok().filter(|&n| usize::from(n) <= RAW_FRAME_CAPACITY)?;
        let mut bytes = [0u8; RAW_FRAME_CAPACITY];
        bytes[..payload.len()].copy_from_slice(payload);
        Some(Self { opcode, len, bytes })
    }

    #[must_use]
    pub const fn opcode(&self) -> u32 {
        self.opcode
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("opcode", &format_args!("{:#06x}", self.opcode))
            .field("payload", &self.payload())
            .finish()
    }
}

/// A unit of work posted to the dispatcher. Payloads are stored inline, so
/// every request occupies the same bounded slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// The network came up; typically starts the LAN control plane.
    GotIp,
    Peripheral(PeripheralEvent),
    /// No-op that makes the worker wake and recompute its timeout.
    Wake,
    UartPayload(UartPayload),
    Temperature(TemperatureReading),
    RawFrame(RawFrame),
    /// Notification from the LAN control plane.
    LanNotify { client: u32 },
}

impl Request {
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::GotIp => RequestKind::GotIp,
            Self::Peripheral(_) => RequestKind::Peripheral,
            Self::Wake => RequestKind::Wake,
            Self::UartPayload(_) => RequestKind::UartPayload,
            Self::Temperature(_) => RequestKind::Temperature,
            Self::RawFrame(_) => RequestKind::RawFrame,
            Self::LanNotify { .. } => RequestKind::LanNotify,
        }
    }
}

/// Result code reported to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Invalid,
    Hardware,
    Timeout,
    General,
    NoMem,
    Rejected,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Response scratch filled by a handler and lent to the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    pub value: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_index_their_own_position() {
        for (i, kind) in RequestKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn raw_frame_bounds() {
        let frame = RawFrame::new(0x04A1, &[1, 2, 3]).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(RawFrame::new(0, &[0; RAW_FRAME_CAPACITY]).is_some());
        assert!(RawFrame::new(0, &[0; RAW_FRAME_CAPACITY + 1]).is_none());
    }

    #[test]
    fn temperature_wire_form() {
        let mut bytes = Vec::new();
        for t in [20.5f64, 21.0, 22.25, -1.0, 0.0, 100.0] {
            bytes.extend_from_slice(&t.to_le_bytes());
        }
        let reading = TemperatureReading::from_le_bytes(&bytes).unwrap();
        assert_eq!(reading.0[2], 22.25);
        assert_eq!(reading.0[5], 100.0);
        assert!(TemperatureReading::from_le_bytes(&bytes[..47]).is_none());
    }

    #[test]
    fn peripheral_data_is_truncated() {
        let words: Vec<i32> = (0..200).collect();
        let ev = PeripheralEvent::new(PeripheralSource::Knob, PeripheralTopic::Knob).with_data(&words);
        assert_eq!(ev.data[127], 127);
    }
}
