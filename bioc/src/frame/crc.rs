/// Reflected form of the 0x8005 generator.
const POLY: u16 = 0xA001;

/// CRC-16/IBM (a.k.a. CRC-16/ARC): init 0, LSB-first, no final xor.
#[must_use]
pub const fn crc16_ibm(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        crc ^= bytes[i] as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        i += 1;
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(crc16_ibm(b"123456789"), 0xBB3D);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc16_ibm(&[]), 0);
    }

    #[test]
    fn state_report_header_and_payload() {
        assert_eq!(crc16_ibm(&[0x64, 0x04, 0xA1, 0x00, 0x04, 0, 1, 2, 3]), 0x9ACA);
        assert_eq!(crc16_ibm(&[0x64, 0x04, 0xA0, 0x00, 0x00]), 0xDA70);
    }
}
