use super::crc::crc16_ibm;
use super::layout::{FrameLayout, CRC_LEN};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PackError {
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("opcode {opcode:#x} does not fit a {width}-byte field")]
    OpcodeTooWide { opcode: u32, width: usize },
    #[error("output buffer holds {have} bytes, frame needs {need}")]
    BufferTooSmall { need: usize, have: usize },
}

/// Encodes one frame into `out`, returning the number of bytes written.
///
/// # Errors
///
/// [`PackError`] if the payload or opcode does not fit `layout`, or `out` is
/// shorter than the frame.
pub fn pack_into(
    layout: &FrameLayout,
    opcode: u32,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, PackError> {
    if payload.len() > layout.max_payload {
        return Err(PackError::PayloadTooLong {
            len: payload.len(),
            max: layout.max_payload,
        });
    }
    if u64::from(opcode) > layout.opcode.max_value() {
        return Err(PackError::OpcodeTooWide {
            opcode,
            width: layout.opcode.bytes(),
        });
    }
    let total = layout.overhead() + payload.len();
    if out.len() < total {
        return Err(PackError::BufferTooSmall {
            need: total,
            have: out.len(),
        });
    }

    let body = layout.payload_offset() + payload.len();
    out[0] = layout.head;
    layout.write_field(layout.opcode, u64::from(opcode), &mut out[layout.opcode_offset()..]);
    layout.write_field(layout.length, payload.len() as u64, &mut out[layout.length_offset()..]);
    out[layout.payload_offset()..body].copy_from_slice(payload);
    let crc = crc16_ibm(&out[..body]);
    out[body..body + CRC_LEN].copy_from_slice(&crc.to_be_bytes());
    out[total - 1] = layout.tail;
    Ok(total)
}

/// Allocating form of [`pack_into`].
///
/// # Errors
///
/// [`PackError`] if the payload or opcode does not fit `layout`.
pub fn pack(layout: &FrameLayout, opcode: u32, payload: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut out = vec![0u8; layout.overhead() + payload.len()];
    pack_into(layout, opcode, payload, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_report_bytes() {
        let bytes = pack(&FrameLayout::UART, 0x04A1, &[0, 1, 2, 3]).unwrap();
        assert_eq!(
            bytes,
            [0x64, 0x04, 0xA1, 0x00, 0x04, 0x00, 0x01, 0x02, 0x03, 0x9A, 0xCA, 0xEE]
        );
    }

    #[test]
    fn empty_payload() {
        let bytes = pack(&FrameLayout::UART, 0x04A0, &[]).unwrap();
        assert_eq!(bytes, [0x64, 0x04, 0xA0, 0x00, 0x00, 0xDA, 0x70, 0xEE]);
    }

    #[test]
    fn spi_header_is_little_endian() {
        let bytes = pack(&FrameLayout::SPI, 0x2001_0000, &[7]).unwrap();
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[..9], &[0x5A, 0x00, 0x00, 0x01, 0x20, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[9], 7);
        assert_eq!(bytes[12], 0xA5);
    }

    #[test]
    fn rejects_what_does_not_fit() {
        let layout = FrameLayout::UART;
        assert_eq!(
            pack(&layout, 1, &[0; 65]),
            Err(PackError::PayloadTooLong { len: 65, max: 64 })
        );
        assert_eq!(
            pack(&layout, 0x1_0000, &[]),
            Err(PackError::OpcodeTooWide {
                opcode: 0x1_0000,
                width: 2
            })
        );
        let mut small = [0u8; 9];
        assert_eq!(
            pack_into(&layout, 1, &[1, 2], &mut small),
            Err(PackError::BufferTooSmall { need: 10, have: 9 })
        );
    }
}
