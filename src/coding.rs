//! eFuse block coding schemes
//!
//! A coding scheme maps the logical contents of a block onto the bits which
//! are physically burned. [`CodingScheme::None`] is the identity mapping,
//! [`CodingScheme::ThreeFourths`] (ESP32 only) keeps 6 data bytes out of
//! every 8, and [`CodingScheme::ReedSolomon`] appends 12 check bytes after the
//! data registers.

use reed_solomon::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::CodingError;

/// Number of Reed-Solomon check bytes stored after a block's data registers.
pub const RS_ECC_LEN: usize = 12;

const GROUP_DATA_LEN: usize = 6;
const GROUP_LEN: usize = 8;

/// Coding scheme of a single eFuse block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Deserialize, Serialize)]
pub enum CodingScheme {
    #[strum(serialize = "None")]
    None,
    #[strum(serialize = "3/4")]
    ThreeFourths,
    #[strum(serialize = "Reed-Solomon")]
    ReedSolomon,
}

/// Result of decoding the physical contents of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Logical block contents
    pub data: Vec<u8>,
    /// Number of bytes the decoder had to correct
    pub corrected: usize,
}

impl CodingScheme {
    /// Number of usable data bytes in a block with `raw_len` data-register
    /// bytes.
    pub fn data_len(self, raw_len: usize) -> usize {
        match self {
            CodingScheme::None | CodingScheme::ReedSolomon => raw_len,
            CodingScheme::ThreeFourths => raw_len / GROUP_LEN * GROUP_DATA_LEN,
        }
    }

    /// Number of bytes physically stored for a block with `raw_len`
    /// data-register bytes.
    pub fn physical_len(self, raw_len: usize) -> usize {
        match self {
            CodingScheme::None | CodingScheme::ThreeFourths => raw_len,
            CodingScheme::ReedSolomon => raw_len + RS_ECC_LEN,
        }
    }

    /// Whether the scheme keeps the full register width for data.
    pub fn is_full_width(self) -> bool {
        self != CodingScheme::ThreeFourths
    }

    /// Encode the logical contents `data` of a block with `raw_len`
    /// data-register bytes.
    ///
    /// Shorter data is padded with zeroes, longer data is rejected.
    pub fn encode(self, data: &[u8], raw_len: usize) -> Result<Vec<u8>, CodingError> {
        let usable = self.data_len(raw_len);
        if data.len() > usable {
            return Err(CodingError::Length {
                expected: usable,
                actual: data.len(),
            });
        }

        let mut padded = vec![0u8; usable];
        padded[..data.len()].copy_from_slice(data);

        let encoded = match self {
            CodingScheme::None => padded,
            CodingScheme::ThreeFourths => padded
                .chunks(GROUP_DATA_LEN)
                .flat_map(|group| {
                    let (xor, mul) = check_bytes(group);
                    group.iter().copied().chain([xor, mul])
                })
                .collect(),
            CodingScheme::ReedSolomon => Encoder::new(RS_ECC_LEN).encode(&padded).to_vec(),
        };

        Ok(encoded)
    }

    /// Decode and verify the physical contents of a block with `raw_len`
    /// data-register bytes.
    pub fn decode(self, physical: &[u8], raw_len: usize) -> Result<Decoded, CodingError> {
        let expected = self.physical_len(raw_len);
        if physical.len() != expected {
            return Err(CodingError::Length {
                expected,
                actual: physical.len(),
            });
        }

        match self {
            CodingScheme::None => Ok(Decoded {
                data: physical.to_vec(),
                corrected: 0,
            }),
            CodingScheme::ThreeFourths => {
                let mut data = Vec::with_capacity(self.data_len(raw_len));
                for (idx, group) in physical.chunks(GROUP_LEN).enumerate() {
                    let (payload, checks) = group.split_at(GROUP_DATA_LEN);
                    if check_bytes(payload) != (checks[0], checks[1]) {
                        return Err(CodingError::CheckMismatch {
                            offset: idx * GROUP_DATA_LEN,
                        });
                    }
                    data.extend_from_slice(payload);
                }

                Ok(Decoded { data, corrected: 0 })
            }
            CodingScheme::ReedSolomon => {
                let decoder = Decoder::new(RS_ECC_LEN);
                if !decoder.is_corrupted(physical) {
                    return Ok(Decoded {
                        data: physical[..raw_len].to_vec(),
                        corrected: 0,
                    });
                }

                let mut msg = physical.to_vec();
                let fixed = decoder
                    .correct(&mut msg, None)
                    .map_err(|_| CodingError::Uncorrectable)?;
                let data = fixed.data().to_vec();
                let corrected = data
                    .iter()
                    .zip(&physical[..raw_len])
                    .filter(|(a, b)| a != b)
                    .count();

                Ok(Decoded { data, corrected })
            }
        }
    }
}

/// XOR and weighted population count of one 3/4 coding group.
fn check_bytes(group: &[u8]) -> (u8, u8) {
    let xor = group.iter().fold(0u8, |acc, b| acc ^ b);
    let mul = group
        .iter()
        .enumerate()
        .map(|(i, b)| (i as u32 + 1) * b.count_ones())
        .sum::<u32>();

    (xor, (mul & 0xff) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len as u8).map(|b| b.wrapping_mul(37) ^ 0x5a).collect()
    }

    #[test]
    fn none_is_identity() {
        let data = sample(32);
        let encoded = CodingScheme::None.encode(&data, 32).unwrap();
        assert_eq!(encoded, data);

        let decoded = CodingScheme::None.decode(&encoded, 32).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.corrected, 0);
    }

    #[test]
    fn three_fourths_usable_width() {
        assert_eq!(CodingScheme::ThreeFourths.data_len(32), 24);
        assert_eq!(CodingScheme::ThreeFourths.physical_len(32), 32);
        assert!(!CodingScheme::ThreeFourths.is_full_width());
        assert!(CodingScheme::ReedSolomon.is_full_width());
    }

    #[test]
    fn three_fourths_check_bytes() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x80];
        let encoded = CodingScheme::ThreeFourths.encode(&data, 32).unwrap();

        // xor of the group, then 1*1 + 2*2 + 6*1
        assert_eq!(&encoded[..8], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x80, 0x82, 11]);
        // zero groups encode to zero
        assert!(encoded[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn three_fourths_round_trip() {
        let data = sample(24);
        let encoded = CodingScheme::ThreeFourths.encode(&data, 32).unwrap();
        assert_eq!(encoded.len(), 32);

        let decoded = CodingScheme::ThreeFourths.decode(&encoded, 32).unwrap();
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn three_fourths_rejects_overflow() {
        let res = CodingScheme::ThreeFourths.encode(&sample(25), 32);
        assert!(matches!(
            res,
            Err(CodingError::Length {
                expected: 24,
                actual: 25
            })
        ));
    }

    #[test]
    fn three_fourths_detects_corrupted_check_word() {
        let mut encoded = CodingScheme::ThreeFourths.encode(&sample(24), 32).unwrap();
        encoded[15] ^= 0x04;

        let res = CodingScheme::ThreeFourths.decode(&encoded, 32);
        assert!(matches!(res, Err(CodingError::CheckMismatch { offset: 6 })));
    }

    #[test]
    fn reed_solomon_round_trip() {
        let data = sample(32);
        let encoded = CodingScheme::ReedSolomon.encode(&data, 32).unwrap();
        assert_eq!(encoded.len(), 32 + RS_ECC_LEN);
        assert_eq!(&encoded[..32], &data[..]);

        let decoded = CodingScheme::ReedSolomon.decode(&encoded, 32).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.corrected, 0);
    }

    #[test]
    fn reed_solomon_corrects_single_byte() {
        let data = sample(32);
        let mut encoded = CodingScheme::ReedSolomon.encode(&data, 32).unwrap();
        encoded[3] ^= 0xff;

        let decoded = CodingScheme::ReedSolomon.decode(&encoded, 32).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.corrected, 1);
    }

    #[test]
    fn unburned_blocks_decode_cleanly() {
        for scheme in [
            CodingScheme::None,
            CodingScheme::ThreeFourths,
            CodingScheme::ReedSolomon,
        ] {
            let physical = vec![0u8; scheme.physical_len(32)];
            let decoded = scheme.decode(&physical, 32).unwrap();
            assert!(decoded.data.iter().all(|b| *b == 0));
        }
    }
}
