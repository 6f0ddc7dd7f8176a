use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn get_crc16(buf: &[u8], maybe_zcrc: Option<u8>) -> [u8; 2] {
    let mut digest = CRC16.digest();

    digest.update(buf);

    if let Some(zcrc) = maybe_zcrc {
        digest.update(&[zcrc]);
    }

    digest.finalize().to_be_bytes()
}

pub fn get_crc32(buf: &[u8], maybe_zcrc: Option<u8>) -> [u8; 4] {
    let mut digest = CRC32.digest();

    digest.update(buf);

    if let Some(zcrc) = maybe_zcrc {
        digest.update(&[zcrc]);
    }

    // Assuming little-endian byte order, given that ZMODEM used to work on
    // VAX, which was a little-endian computer architecture:
    digest.finalize().to_le_bytes()
}

/// CRC-32 over a plain buffer, as exchanged in ZCRC headers.
pub fn file_crc32(buf: &[u8]) -> u32 {
    CRC32.checksum(buf)
}

pub fn check_crc16(buf: &[u8], zcrc: Option<u8>, trailer: &[u8]) -> bool {
    let crc = get_crc16(buf, zcrc);
    if crc != trailer {
        log::debug!("CRC-16 mismatch: {:02x?} != {:02x?}", trailer, crc);
        return false;
    }
    true
}

pub fn check_crc32(buf: &[u8], zcrc: Option<u8>, trailer: &[u8]) -> bool {
    let crc = get_crc32(buf, zcrc);
    if crc != trailer {
        log::debug!("CRC-32 mismatch: {:02x?} != {:02x?}", trailer, crc);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // The CRC-32 accumulator after running a frame plus its little-endian
    // trailer, before the final xor-out.
    const CRC32_RESIDUE: u32 = 0xdebb20e3;

    #[rstest::rstest]
    #[case(&[0, 0, 0, 0, 0], [0, 0])]
    #[case(&[0, 1, 1, 1, 1], [98, 148])]
    #[case(&[1, 0x1, 0x2, 0x3, 0x4], [0xa7, 0x52])]
    fn test_crc16(#[case] data: &[u8], #[case] expected: [u8; 2]) {
        assert_eq!(get_crc16(data, None), expected);
    }

    #[rstest::rstest]
    #[case(&[0, 0, 0, 0, 0], [29, 247, 34, 198])]
    fn test_crc32(#[case] data: &[u8], #[case] expected: [u8; 4]) {
        assert_eq!(get_crc32(data, None), expected);
    }

    /// A buffer followed by its own CRC trailer always verifies, and the
    /// 16-bit accumulator over buffer-plus-trailer reduces to zero.
    #[rstest::rstest]
    #[case(b"")]
    #[case(b"hi.txt")]
    #[case(&[0xff; 64])]
    fn test_residue(#[case] data: &[u8]) {
        let t16 = get_crc16(data, None);
        assert!(check_crc16(data, None, &t16));
        let mut whole = data.to_vec();
        whole.extend_from_slice(&t16);
        assert_eq!(get_crc16(&whole, None), [0, 0]);

        let t32 = get_crc32(data, None);
        assert!(check_crc32(data, None, &t32));
        let mut whole = data.to_vec();
        whole.extend_from_slice(&t32);
        // get_crc32 applies the final xor-out, so undo it to observe the
        // canonical residue.
        let acc = u32::from_le_bytes(get_crc32(&whole, None)) ^ 0xffff_ffff;
        assert_eq!(acc, CRC32_RESIDUE);
    }

    #[test]
    fn test_corrupted_trailer() {
        let data = b"stream of file data";
        let mut t16 = get_crc16(data, Some(0x6b));
        t16[0] ^= 0x10;
        assert!(!check_crc16(data, Some(0x6b), &t16));
        let mut t32 = get_crc32(data, Some(0x6b));
        t32[3] ^= 0x01;
        assert!(!check_crc32(data, Some(0x6b), &t32));
    }
}
