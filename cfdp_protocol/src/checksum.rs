// checksum.rs — file checksums carried in Metadata/EOF

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    /// 32-bit sum of big-endian words aligned on file offset 0.
    #[default]
    Modular,
    /// CRC-32 (IEEE 802.3).
    Crc32,
    /// Always zero; the receiver skips verification.
    Null,
}

impl ChecksumType {
    pub fn code(self) -> u8 {
        match self {
            ChecksumType::Modular => 0,
            ChecksumType::Crc32 => 3,
            ChecksumType::Null => 15,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChecksumType::Modular),
            3 => Some(ChecksumType::Crc32),
            15 => Some(ChecksumType::Null),
            _ => None,
        }
    }

    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            ChecksumType::Modular => modular(data),
            ChecksumType::Crc32 => crc32fast::hash(data),
            ChecksumType::Null => 0,
        }
    }

    /// `Null` checksums always verify.
    pub fn verify(self, data: &[u8], expected: u32) -> bool {
        self == ChecksumType::Null || self.compute(data) == expected
    }
}

fn modular(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut words = data.chunks_exact(4);
    for w in &mut words {
        sum = sum.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]]));
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        // trailing bytes are zero-padded on the right
        let mut last = [0u8; 4];
        last[..tail.len()].copy_from_slice(tail);
        sum = sum.wrapping_add(u32::from_be_bytes(last));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_pads_tail() {
        // 0x01020304 + 0x05000000
        assert_eq!(ChecksumType::Modular.compute(&[1, 2, 3, 4, 5]), 0x0602_0304);
        assert_eq!(ChecksumType::Modular.compute(&[]), 0);
    }

    #[test]
    fn modular_wraps() {
        let data = [0xFF; 8];
        assert_eq!(ChecksumType::Modular.compute(&data), 0xFFFF_FFFEu32);
    }

    #[test]
    fn crc32_matches_reference() {
        // standard check value for "123456789"
        assert_eq!(ChecksumType::Crc32.compute(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn null_always_verifies() {
        assert!(ChecksumType::Null.verify(b"anything", 0xDEAD_BEEF));
        assert!(!ChecksumType::Crc32.verify(b"anything", 0xDEAD_BEEF));
    }

    #[test]
    fn codes_roundtrip() {
        for t in [ChecksumType::Modular, ChecksumType::Crc32, ChecksumType::Null] {
            assert_eq!(ChecksumType::from_code(t.code()), Some(t));
        }
        assert_eq!(ChecksumType::from_code(7), None);
    }
}
