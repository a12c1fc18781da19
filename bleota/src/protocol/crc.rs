//! CRC-32 checksum used for packet framing, image verification and the
//! activation descriptor.
//!
//! The algorithm is the common IEEE 802.3 CRC-32 (reflected, polynomial
//! `0x04C11DB7`, init and xorout `0xFFFFFFFF`), known to the `crc` crate as
//! `CRC_32_ISO_HDLC`.

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

/// CRC-32 engine shared by every checksum in the crate.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 of a byte slice in one shot.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Start a streaming CRC-32 computation.
pub fn crc32_digest() -> Digest<'static, u32> {
    CRC32.digest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Standard check input for CRC catalogues.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut digest = crc32_digest();
        for chunk in data.chunks(77) {
            digest.update(chunk);
        }
        assert_eq!(digest.finalize(), crc32(&data));
    }
}
