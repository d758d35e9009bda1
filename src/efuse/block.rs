use std::ops::Range;

use bitflags::bitflags;
use log::warn;

use super::field::{read_bits, write_bits};
use crate::{
    coding::CodingScheme,
    error::{CodingError, Error, ProtectionError, TransportError},
    targets::BlockDef,
};

bitflags! {
    /// Protection state of a block or field
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Runtime state of an eFuse block
///
/// `burned` mirrors what was last read from the device, `pending` holds the
/// staged contents which the next commit will burn. Both hold the logical,
/// decoded contents of the block.
#[derive(Debug, Clone)]
pub struct Block {
    def: &'static BlockDef,
    scheme: CodingScheme,
    burned: Vec<u8>,
    pending: Vec<u8>,
    corrected: usize,
    fail: bool,
}

impl Block {
    pub(crate) fn new(def: &'static BlockDef, scheme: CodingScheme) -> Self {
        let len = scheme.data_len(def.raw_len());

        Self {
            def,
            scheme,
            burned: vec![0; len],
            pending: vec![0; len],
            corrected: 0,
            fail: false,
        }
    }

    pub fn def(&self) -> &'static BlockDef {
        self.def
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn index(&self) -> u8 {
        self.def.index
    }

    pub fn scheme(&self) -> CodingScheme {
        self.scheme
    }

    /// Usable length of the block in bytes.
    pub fn len(&self) -> usize {
        self.burned.len()
    }

    pub fn bit_len(&self) -> usize {
        self.len() * 8
    }

    /// Contents as last read from the device.
    pub fn burned(&self) -> &[u8] {
        &self.burned
    }

    /// Contents the next commit will burn.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// No bit of the block has been burned yet.
    pub fn is_empty(&self) -> bool {
        self.burned.iter().all(|b| *b == 0)
    }

    /// The block has staged changes.
    pub fn is_dirty(&self) -> bool {
        self.pending != self.burned
    }

    /// Number of bytes the coding scheme had to correct on the last read.
    pub fn corrected(&self) -> usize {
        self.corrected
    }

    /// The stored bits failed coding-scheme verification on the last read.
    pub fn failed(&self) -> bool {
        self.fail
    }

    pub fn has_errors(&self) -> bool {
        self.fail || self.corrected > 0
    }

    /// Load the physical contents read from the device, discarding any
    /// staged changes.
    pub(crate) fn load(&mut self, physical: &[u8], scheme: CodingScheme) -> Result<(), Error> {
        let raw_len = self.def.raw_len();
        let expected = scheme.physical_len(raw_len);
        if physical.len() != expected {
            return Err(TransportError::Length {
                block: self.def.index,
                expected,
                actual: physical.len(),
            }
            .into());
        }

        self.scheme = scheme;
        self.corrected = 0;
        self.fail = false;

        self.burned = match scheme.decode(physical, raw_len) {
            Ok(decoded) => {
                if decoded.corrected > 0 {
                    warn!(
                        "{}: {} byte(s) corrected by the coding scheme",
                        self.name(),
                        decoded.corrected
                    );
                }
                self.corrected = decoded.corrected;
                decoded.data
            }
            Err(err) => {
                warn!("{}: {err}", self.name());
                self.fail = true;
                undecoded(scheme, physical, raw_len)
            }
        };
        self.pending = self.burned.clone();

        Ok(())
    }

    pub(crate) fn pending_bits(&self, range: Range<usize>) -> Vec<u8> {
        read_bits(&self.pending, range)
    }

    pub(crate) fn burned_bits(&self, range: Range<usize>) -> Vec<u8> {
        read_bits(&self.burned, range)
    }

    /// Stage `bits` at `range`, refusing to clear bits which are burned.
    ///
    /// Returns whether the pending contents changed.
    pub(crate) fn stage(
        &mut self,
        name: &str,
        range: Range<usize>,
        bits: &[u8],
    ) -> Result<bool, Error> {
        let burned = self.burned_bits(range.clone());
        if burned.iter().zip(bits).any(|(old, new)| old & !new != 0) {
            return Err(ProtectionError::ClearBurnedBits {
                name: name.to_owned(),
            }
            .into());
        }

        if self.pending_bits(range.clone()) == bits {
            return Ok(false);
        }

        write_bits(&mut self.pending, range, bits);
        Ok(true)
    }

    /// Stage the whole block.
    pub(crate) fn stage_data(&mut self, data: &[u8]) -> Result<bool, Error> {
        if data.len() != self.len() {
            return Err(Error::SizeMismatch {
                name: self.name().to_owned(),
                expected: self.len(),
                actual: data.len(),
            });
        }

        self.stage(self.def.name, 0..self.bit_len(), data)
    }

    /// Encode the pending contents for burning.
    pub(crate) fn encode_pending(&self) -> Result<Vec<u8>, Error> {
        if self.scheme != CodingScheme::None && !self.is_empty() && self.is_dirty() {
            return Err(Error::CodingScheme {
                block: self.name().to_owned(),
                source: CodingError::Rewrite,
            });
        }

        self.scheme
            .encode(&self.pending, self.def.raw_len())
            .map_err(|source| match source {
                CodingError::Length { expected, actual } => Error::EncodingOverflow {
                    block: self.name().to_owned(),
                    usable: expected,
                    actual,
                },
                source => Error::CodingScheme {
                    block: self.name().to_owned(),
                    source,
                },
            })
    }

    /// Encode the burned contents again, used to repair coding errors.
    pub(crate) fn encode_burned(&self) -> Result<Vec<u8>, Error> {
        self.scheme
            .encode(&self.burned, self.def.raw_len())
            .map_err(|source| Error::CodingScheme {
                block: self.name().to_owned(),
                source,
            })
    }

    pub(crate) fn set_pending(&mut self, pending: Vec<u8>) {
        self.pending = pending;
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending = self.burned.clone();
    }

    #[cfg(test)]
    pub(crate) fn assume_burned(&mut self) {
        self.burned = self.pending.clone();
    }
}

/// Data bytes of a block whose check bits are inconsistent.
fn undecoded(scheme: CodingScheme, physical: &[u8], raw_len: usize) -> Vec<u8> {
    match scheme {
        CodingScheme::ThreeFourths => physical
            .chunks(8)
            .flat_map(|group| group[..6].iter().copied())
            .collect(),
        CodingScheme::None | CodingScheme::ReedSolomon => physical[..raw_len].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Chip;

    fn key0() -> Block {
        let def = Chip::Esp32c6.into_target().block("BLOCK_KEY0").unwrap();
        Block::new(def, CodingScheme::ReedSolomon)
    }

    #[test]
    fn staging_marks_block_dirty() {
        let mut block = key0();
        assert!(block.is_empty());
        assert!(!block.is_dirty());

        assert!(block.stage_data(&[0xaa; 32]).unwrap());
        assert!(block.is_dirty());
        assert_eq!(block.pending(), &[0xaa; 32]);
        assert_eq!(block.burned(), &[0; 32]);

        // identical data is a no-op
        assert!(!block.stage_data(&[0xaa; 32]).unwrap());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let mut block = key0();
        let res = block.stage_data(&[0; 31]);

        assert!(matches!(
            res,
            Err(Error::SizeMismatch {
                expected: 32,
                actual: 31,
                ..
            })
        ));
        assert!(!block.is_dirty());
    }

    #[test]
    fn burned_bits_cannot_be_cleared() {
        let mut block = key0();
        let physical = CodingScheme::ReedSolomon.encode(&[0x0f; 32], 32).unwrap();
        block.load(&physical, CodingScheme::ReedSolomon).unwrap();

        let res = block.stage("BLOCK_KEY0", 0..8, &[0x0e]);
        assert!(matches!(
            res,
            Err(Error::ProtectionViolation(ProtectionError::ClearBurnedBits { .. }))
        ));
        assert!(!block.is_dirty());
    }

    #[test]
    fn coded_blocks_are_written_once() {
        let mut block = key0();
        let physical = CodingScheme::ReedSolomon.encode(&[0x01; 32], 32).unwrap();
        block.load(&physical, CodingScheme::ReedSolomon).unwrap();

        block.stage("BLOCK_KEY0", 8..16, &[0x03]).unwrap();
        assert!(matches!(
            block.encode_pending(),
            Err(Error::CodingScheme {
                source: CodingError::Rewrite,
                ..
            })
        ));
    }

    #[test]
    fn inconsistent_check_bits_mark_block_failed() {
        let def = Chip::Esp32.into_target().block("BLOCK3").unwrap();
        let mut block = Block::new(def, CodingScheme::ThreeFourths);
        assert_eq!(block.len(), 24);

        let mut physical = CodingScheme::ThreeFourths.encode(&[0x11; 24], 32).unwrap();
        physical[7] ^= 0x01;
        block.load(&physical, CodingScheme::ThreeFourths).unwrap();

        assert!(block.failed());
        assert!(block.has_errors());
        assert_eq!(block.burned(), &[0x11; 24]);
    }

    #[test]
    fn short_reads_are_transport_errors() {
        let mut block = key0();
        let res = block.load(&[0; 32], CodingScheme::ReedSolomon);

        assert!(matches!(
            res,
            Err(Error::Transport(TransportError::Length {
                expected: 44,
                actual: 32,
                ..
            }))
        ));
    }
}
