use std::{fmt, ops::Range};

use super::{Efuses, Protection};
use crate::{
    error::{Error, ProtectionError},
    targets::{FieldCategory, FieldDef, FieldKind},
};

/// Value of an eFuse field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Uint(u64),
    /// Little-endian bytes, as stored in the block.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Numeric value, taking at most the first eight bytes of a byte field.
    pub fn as_u64(&self) -> u64 {
        match self {
            FieldValue::Bool(b) => *b as u64,
            FieldValue::Uint(v) => *v,
            FieldValue::Bytes(bytes) => bytes
                .iter()
                .take(8)
                .enumerate()
                .fold(0, |acc, (i, b)| acc | (*b as u64) << (i * 8)),
        }
    }

    /// Encode the value into exactly `width` bits for the field `name`.
    fn to_bits(&self, name: &str, width: usize) -> Result<Vec<u8>, Error> {
        let len = width.div_ceil(8);

        let bits = match self {
            FieldValue::Bytes(bytes) => {
                if bytes.len() != len {
                    return Err(Error::SizeMismatch {
                        name: name.to_owned(),
                        expected: len,
                        actual: bytes.len(),
                    });
                }
                bytes.clone()
            }
            FieldValue::Bool(_) | FieldValue::Uint(_) => {
                let value = self.as_u64();
                if width < 64 && value >> width != 0 {
                    return Err(Error::FieldOverflow {
                        name: name.to_owned(),
                        width,
                        value,
                    });
                }

                let mut bits = vec![0u8; len];
                for (dst, src) in bits.iter_mut().zip(value.to_le_bytes()) {
                    *dst = src;
                }
                bits
            }
        };

        if width % 8 != 0 && bits[len - 1] >> (width % 8) != 0 {
            return Err(Error::FieldOverflow {
                name: name.to_owned(),
                width,
                value: self.as_u64(),
            });
        }

        Ok(bits)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Uint(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Bytes(bytes) => {
                // most-significant byte first, like a big number
                for b in bytes.iter().rev() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Read-only view of a field
#[derive(Clone, Copy)]
pub struct Field<'a> {
    pub(super) def: &'static FieldDef,
    pub(super) efuses: &'a Efuses,
}

impl Field<'_> {
    pub fn def(&self) -> &'static FieldDef {
        self.def
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Number of bits usable under the block's current coding scheme.
    pub fn bit_len(&self) -> usize {
        usable_range(self.def, self.efuses.block_bit_len(self.def.block)).len()
    }

    /// The burned value.
    pub fn get(&self) -> FieldValue {
        decode(self.def, self.get_raw(), self.bit_len())
    }

    /// The value the next commit will leave behind.
    pub fn get_pending(&self) -> FieldValue {
        decode(self.def, self.get_pending_raw(), self.bit_len())
    }

    /// Burned bits, packed least-significant bit first.
    pub fn get_raw(&self) -> Vec<u8> {
        let block = self.efuses.block_by_index(self.def.block);
        block.burned_bits(usable_range(self.def, block.bit_len()))
    }

    pub fn get_pending_raw(&self) -> Vec<u8> {
        let block = self.efuses.block_by_index(self.def.block);
        block.pending_bits(usable_range(self.def, block.bit_len()))
    }

    pub fn protection(&self) -> Protection {
        let block = self.efuses.block_by_index(self.def.block).def();
        let mut protection = Protection::empty();

        if let Some(bit) = self.def.read_disable_bit.or(block.read_disable_bit) {
            protection.set(Protection::READ, self.efuses.is_read_disabled(bit));
        }
        if let Some(bit) = self.def.write_disable_bit.or(block.write_disable_bit) {
            protection.set(Protection::WRITE, self.efuses.is_write_disabled(bit));
        }

        protection
    }

    pub fn is_readable(&self) -> bool {
        !self.protection().contains(Protection::READ)
    }

    pub fn is_writeable(&self) -> bool {
        !self.protection().contains(Protection::WRITE)
    }
}

impl fmt::Debug for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.def.name)
            .field("value", &self.get())
            .finish()
    }
}

/// Mutable view of a field, changes are staged until the next commit
pub struct FieldMut<'a> {
    pub(super) def: &'static FieldDef,
    pub(super) efuses: &'a mut Efuses,
}

impl FieldMut<'_> {
    pub fn as_field(&self) -> Field<'_> {
        Field {
            def: self.def,
            efuses: &*self.efuses,
        }
    }

    /// Stage `value`.
    ///
    /// Staging the value the field already holds is a no-op. Returns whether
    /// the pending contents changed.
    pub fn save(&mut self, value: &FieldValue) -> Result<bool, Error> {
        let field = self.as_field();
        let range = usable_range(self.def, self.efuses.block_bit_len(self.def.block));
        let bits = value.to_bits(self.def.name, range.len())?;

        if field.get_pending_raw() == bits {
            return Ok(false);
        }

        if self.def.category == FieldCategory::Calibration {
            return Err(ProtectionError::ReadOnly {
                name: self.def.name.to_owned(),
            }
            .into());
        }
        if !field.is_writeable() && !self.efuses.force_write_always {
            return Err(ProtectionError::WriteProtected {
                name: self.def.name.to_owned(),
            }
            .into());
        }

        self.efuses
            .block_by_index_mut(self.def.block)
            .stage(self.def.name, range, &bits)
    }

    /// Stage the `WR_DIS` bit guarding this field.
    pub fn disable_write(&mut self) -> Result<bool, Error> {
        let block = self.efuses.block_by_index(self.def.block).def();
        let bit = self
            .def
            .write_disable_bit
            .or(block.write_disable_bit)
            .ok_or_else(|| ProtectionError::NoProtectionBit {
                name: self.def.name.to_owned(),
                kind: "write-disable",
            })?;

        self.efuses.stage_flag("WR_DIS", bit)
    }

    /// Stage the `RD_DIS` bit guarding this field.
    pub fn disable_read(&mut self) -> Result<bool, Error> {
        let block = self.efuses.block_by_index(self.def.block).def();
        let bit = self
            .def
            .read_disable_bit
            .or(block.read_disable_bit)
            .ok_or_else(|| ProtectionError::NoProtectionBit {
                name: self.def.name.to_owned(),
                kind: "read-disable",
            })?;

        self.efuses.stage_flag("RD_DIS", bit)
    }
}

/// Bits of `def` which fit into a block of `block_bits` usable bits.
fn usable_range(def: &FieldDef, block_bits: usize) -> Range<usize> {
    let range = def.bit_range();
    range.start.min(block_bits)..range.end.min(block_bits)
}

fn decode(def: &FieldDef, raw: Vec<u8>, width: usize) -> FieldValue {
    match def.kind {
        FieldKind::Bool => FieldValue::Bool(raw.iter().any(|b| *b != 0)),
        FieldKind::Uint | FieldKind::KeyPurpose if width <= 64 => {
            FieldValue::Uint(FieldValue::Bytes(raw).as_u64())
        }
        _ => FieldValue::Bytes(raw),
    }
}

/// Read the bits at `range` of `buf`, packed least-significant bit first.
///
/// Bits beyond the end of `buf` read as zero.
pub(crate) fn read_bits(buf: &[u8], range: Range<usize>) -> Vec<u8> {
    let mut out = vec![0u8; range.len().div_ceil(8)];

    for (i, bit) in range.enumerate() {
        let set = buf.get(bit / 8).is_some_and(|b| b >> (bit % 8) & 1 == 1);
        if set {
            out[i / 8] |= 1 << (i % 8);
        }
    }

    out
}

/// Write `value`, packed least-significant bit first, to the bits at `range`
/// of `buf`.
pub(crate) fn write_bits(buf: &mut [u8], range: Range<usize>, value: &[u8]) {
    for (i, bit) in range.enumerate() {
        let set = value.get(i / 8).is_some_and(|b| b >> (i % 8) & 1 == 1);
        if let Some(byte) = buf.get_mut(bit / 8) {
            if set {
                *byte |= 1 << (bit % 8);
            } else {
                *byte &= !(1 << (bit % 8));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_little_endian() {
        let buf = [0b1010_0000, 0b0000_0101];

        assert_eq!(read_bits(&buf, 5..11), vec![0b0010_1101]);
        assert_eq!(read_bits(&buf, 0..16), buf.to_vec());
        // out of range bits are zero
        assert_eq!(read_bits(&buf, 14..20), vec![0]);
    }

    #[test]
    fn write_then_read_bits() {
        let mut buf = [0u8; 4];
        write_bits(&mut buf, 88..92, &[0b1111]);
        assert_eq!(buf, [0; 4]);

        write_bits(&mut buf, 6..10, &[0b1001]);
        assert_eq!(buf, [0b0100_0000, 0b0000_0010, 0, 0]);
        assert_eq!(read_bits(&buf, 6..10), vec![0b1001]);
    }

    #[test]
    fn value_encoding() {
        assert_eq!(FieldValue::Uint(5).to_bits("X", 4).unwrap(), vec![5]);
        assert_eq!(FieldValue::Bool(true).to_bits("X", 1).unwrap(), vec![1]);
        assert_eq!(
            FieldValue::Uint(0x1234).to_bits("X", 16).unwrap(),
            vec![0x34, 0x12]
        );

        assert!(matches!(
            FieldValue::Uint(16).to_bits("X", 4),
            Err(Error::FieldOverflow { width: 4, value: 16, .. })
        ));
        assert!(matches!(
            FieldValue::Bytes(vec![0; 5]).to_bits("MAC", 48),
            Err(Error::SizeMismatch {
                expected: 6,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn value_display() {
        assert_eq!(FieldValue::Bool(true).to_string(), "True");
        assert_eq!(FieldValue::Uint(42).to_string(), "42");
        assert_eq!(FieldValue::Bytes(vec![0x01, 0xab]).to_string(), "ab01");
        assert_eq!(FieldValue::Bytes(vec![0x01, 0xab]).as_u64(), 0xab01);
    }
}
